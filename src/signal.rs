//! Signal Generator (§4.5). Consumes `orderbook_stream` in bounded batches
//! from the last processed id. For each symbol's newest tick in the batch,
//! compares the maker venue's top-of-book against the taker venue's,
//! widened or tightened by whichever threshold line applies given the
//! current position, and emits at most one `OrderSignal`. Grounded on
//! `cross_arbitrage/fetch/order_book.py`'s `gen_order_signal`.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::aggregator::AggregatedTick;
use crate::config::OrderConfig;
use crate::context::CancelContext;
use crate::position::PositionCache;
use crate::store::Store;
use crate::symbol::SymbolRegistry;
use crate::threshold::SymbolThresholds;
use crate::venue::{OrderSide, VenueKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSignal {
    pub maker_venue: VenueKind,
    pub taker_venue: VenueKind,
    pub symbol: String,
    pub maker_side: OrderSide,
    pub taker_side: OrderSide,
    pub maker_price: Decimal,
    pub maker_qty: Decimal,
    pub cancel_order_threshold: Decimal,
    pub is_reduce_position: bool,
    pub ts_ms: i64,
}

pub struct SignalGenerator {
    pub config: Arc<OrderConfig>,
    pub registry: Arc<SymbolRegistry>,
    pub store: Store,
    pub position_cache: Arc<PositionCache>,
}

impl SignalGenerator {
    /// Consumes one batch starting after `last_id`, returning the new
    /// `last_id` and at most one signal per symbol.
    pub async fn process_batch(&self, last_id: &str, count: usize) -> (String, Vec<OrderSignal>) {
        let entries = match self.store.xread_ticks("orderbook_stream", last_id, count, None).await {
            Ok(e) => e,
            Err(e) => {
                log::warn!("[SIGNAL] xread failed: {e}");
                return (last_id.to_string(), Vec::new());
            }
        };
        if entries.is_empty() {
            return (last_id.to_string(), Vec::new());
        }

        let mut newest_id = last_id.to_string();
        // Forward overwrite keeps whichever tick for a symbol arrived last in
        // the batch, which is equivalent to "process in reverse, newest
        // wins" (§4.5) without an actual reverse traversal.
        let mut newest_per_symbol: std::collections::HashMap<String, AggregatedTick> = std::collections::HashMap::new();
        for (id, fields) in entries {
            newest_id = id;
            for (_field, json) in fields {
                match serde_json::from_str::<AggregatedTick>(&json) {
                    Ok(tick) => {
                        newest_per_symbol.insert(tick.symbol.clone(), tick);
                    }
                    Err(e) => log::warn!("[SIGNAL] malformed tick skipped: {e}"),
                }
            }
        }

        let mut signals = Vec::new();
        for (symbol, tick) in newest_per_symbol {
            if let Some(signal) = self.evaluate_symbol(&symbol, &tick).await {
                signals.push(signal);
            }
        }
        (newest_id, signals)
    }

    async fn evaluate_symbol(&self, symbol: &str, tick: &AggregatedTick) -> Option<OrderSignal> {
        let symbol_data = self.config.symbol_data(symbol)?;
        let sym = self.registry.get(symbol)?;
        let maker_venue = if symbol_data.makeonly_exchange_name == "A" { VenueKind::A } else { VenueKind::B };
        let taker_venue = maker_venue.other();

        if self.store.is_locked_processing(maker_venue.name(), symbol).await.unwrap_or(true) {
            return None;
        }

        let (maker_book, taker_book) = match maker_venue {
            VenueKind::A => (&tick.venue_a, &tick.venue_b),
            VenueKind::B => (&tick.venue_b, &tick.venue_a),
        };

        let thresholds: SymbolThresholds = self
            .store
            .hget_thresholds(maker_venue.name(), symbol)
            .await
            .unwrap_or(None)?;

        let pos = self.position_cache.get(maker_venue.name(), symbol).await;
        let long_qty = pos.as_ref().filter(|p| p.direction == crate::venue::PositionDirection::Long).map(|p| p.qty).unwrap_or(Decimal::ZERO);
        let short_qty = pos.as_ref().filter(|p| p.direction == crate::venue::PositionDirection::Short).map(|p| p.qty).unwrap_or(Decimal::ZERO);

        // High side (maker sells): a long position of at least min size means
        // selling reduces it, so the looser "decrease" line applies;
        // otherwise selling opens/extends a short, the tighter "increase"
        // line guards entry.
        let high_reducing = long_qty >= sym.min_amount;
        let high_side = if high_reducing { thresholds.long.decrease } else { thresholds.short.increase };
        let high_cancel = if high_reducing { thresholds.long.cancel_decrease } else { thresholds.short.cancel_increase };

        // Low side (maker buys): symmetric against a short position.
        let low_reducing = short_qty >= sym.min_amount;
        let low_side = if low_reducing { thresholds.short.decrease } else { thresholds.long.increase };
        let low_cancel = if low_reducing { thresholds.short.cancel_decrease } else { thresholds.long.cancel_increase };

        if let (Some(maker_ask), Some(taker_ask)) = (maker_book.best_ask(), taker_book.best_ask()) {
            let (maker_price, _) = maker_ask;
            let (taker_price, taker_qty) = taker_ask;
            if maker_price > taker_price * (Decimal::ONE + high_side) {
                let qty = if high_reducing { taker_qty.min(long_qty) } else { taker_qty };
                if qty > Decimal::ZERO {
                    return Some(OrderSignal {
                        maker_venue,
                        taker_venue,
                        symbol: symbol.to_string(),
                        maker_side: OrderSide::Sell,
                        taker_side: OrderSide::Buy,
                        maker_price,
                        maker_qty: qty,
                        cancel_order_threshold: high_cancel,
                        is_reduce_position: high_reducing,
                        ts_ms: tick.ts_ms,
                    });
                }
            }
        }

        if let (Some(maker_bid), Some(taker_bid)) = (maker_book.best_bid(), taker_book.best_bid()) {
            let (maker_price, _) = maker_bid;
            let (taker_price, taker_qty) = taker_bid;
            if maker_price < taker_price * (Decimal::ONE + low_side) {
                let qty = if low_reducing { taker_qty.min(short_qty) } else { taker_qty };
                if qty > Decimal::ZERO {
                    return Some(OrderSignal {
                        maker_venue,
                        taker_venue,
                        symbol: symbol.to_string(),
                        maker_side: OrderSide::Buy,
                        taker_side: OrderSide::Sell,
                        maker_price,
                        maker_qty: qty,
                        cancel_order_threshold: low_cancel,
                        is_reduce_position: low_reducing,
                        ts_ms: tick.ts_ms,
                    });
                }
            }
        }

        None
    }

    /// Drives the batch loop, handing each emitted signal to `dispatch`
    /// (the Signal Dispatcher's admission-control entry point) before
    /// fetching the next batch.
    pub async fn run<F, Fut>(&self, ctx: CancelContext, mut last_id: String, dispatch: F)
    where
        F: Fn(OrderSignal) -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        loop {
            if ctx.is_canceled() {
                return;
            }
            let (new_id, signals) = self.process_batch(&last_id, 100).await;
            last_id = new_id;
            for signal in signals {
                dispatch(signal).await;
            }
            ctx.sleep(Duration::from_millis(200), Duration::from_millis(200)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::OrderBookSnapshot;
    use rust_decimal_macros::dec;

    fn book(venue: VenueKind, bid: Decimal, ask: Decimal) -> OrderBookSnapshot {
        OrderBookSnapshot {
            venue,
            symbol: "BNB/USDT".into(),
            ts_ms: 1,
            bids: vec![(bid, dec!(2))],
            asks: vec![(ask, dec!(2))],
        }
    }

    #[test]
    fn high_side_trigger_condition_matches_formula() {
        let maker_ask = dec!(101);
        let taker_ask = dec!(100);
        let threshold = dec!(0.0012);
        assert!(maker_ask > taker_ask * (Decimal::ONE + threshold));

        let maker_ask_within = dec!(100.05);
        assert!(maker_ask_within <= taker_ask * (Decimal::ONE + threshold));
    }

    #[test]
    fn book_best_levels_feed_the_comparison() {
        let maker = book(VenueKind::A, dec!(99.9), dec!(100.1));
        let taker = book(VenueKind::B, dec!(99.8), dec!(100));
        assert_eq!(maker.best_ask().unwrap().0, dec!(100.1));
        assert_eq!(taker.best_ask().unwrap().0, dec!(100));
    }
}
