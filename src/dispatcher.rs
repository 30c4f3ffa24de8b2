//! Signal Dispatcher (§4.6). Admission controller sitting between the
//! Signal Generator and the Signal Dealer: enforces `order_mode` gating,
//! margin and notional caps, aligns quantity to both venues' precision, then
//! atomically claims the per-`(maker_venue, symbol)` lock before spawning a
//! dealer task. Grounded on `cross_arbitrage/order/dispatch_signal.py`.

use std::sync::Arc;

use rust_decimal::Decimal;

use crate::audit::{AuditLog, AuditRow};
use crate::config::OrderConfig;
use crate::context::CancelContext;
use crate::dealer::DealerTask;
use crate::order_status::StreamReadyFlag;
use crate::signal::OrderSignal;
use crate::store::Store;
use crate::symbol::SymbolRegistry;
use crate::venue::{align_qty, VenueAdapter, VenueKind};

pub struct SignalDispatcher {
    pub config: Arc<OrderConfig>,
    pub registry: Arc<SymbolRegistry>,
    pub store: Store,
    pub ctx: CancelContext,
    pub venue_a: Arc<dyn VenueAdapter>,
    pub venue_b: Arc<dyn VenueAdapter>,
    pub audit: Arc<AuditLog>,
    pub stream_ready: StreamReadyFlag,
}

impl SignalDispatcher {
    fn adapter(&self, venue: VenueKind) -> Arc<dyn VenueAdapter> {
        match venue {
            VenueKind::A => self.venue_a.clone(),
            VenueKind::B => self.venue_b.clone(),
        }
    }

    /// Entry point called from the Signal Generator loop for every emitted
    /// signal (§4.6 steps 1-3).
    pub async fn dispatch(&self, signal: OrderSignal) {
        if !self.stream_ready.is_ready() {
            log::info!("[DISPATCH] {}:{} dropped, order-status stream not ready yet", signal.maker_venue, signal.symbol);
            self.record_skip(&signal, "stream_not_ready").await;
            return;
        }

        let mode = self.ctx.order_mode();
        if !mode.allows_new_dealer(signal.is_reduce_position) {
            log::info!(
                "[DISPATCH] {}:{} dropped, order_mode={:?} reduce={}",
                signal.maker_venue, signal.symbol, mode, signal.is_reduce_position
            );
            self.record_skip(&signal, "skipped_by_mode").await;
            return;
        }

        let symbol_data = match self.config.symbol_data(&signal.symbol) {
            Some(s) => s,
            None => {
                log::warn!("[DISPATCH] no symbol_data for {}", signal.symbol);
                return;
            }
        };
        let sym = match self.registry.get(&signal.symbol) {
            Some(s) => s,
            None => {
                log::warn!("[DISPATCH] symbol mapping miss for {}", signal.symbol);
                return;
            }
        };

        if !signal.is_reduce_position {
            for venue in [signal.maker_venue, signal.taker_venue] {
                match self.store.get_margin(venue.name()).await {
                    Ok(Some((used, _free, total))) if !total.is_zero() => {
                        if used / total >= self.config.max_used_margin {
                            log::info!("[DISPATCH] {}:{} dropped, {venue} margin used/total over cap", signal.maker_venue, signal.symbol);
                            self.record_skip(&signal, "margin_cap").await;
                            return;
                        }
                    }
                    _ => {
                        log::warn!("[DISPATCH] no margin snapshot yet for {venue}, dropping signal conservatively");
                        self.record_skip(&signal, "margin_unknown").await;
                        return;
                    }
                }
            }
        }

        let mut qty = signal.maker_qty;
        if !signal.maker_price.is_zero() {
            let notional_cap_qty = symbol_data.max_notional_per_order / signal.maker_price;
            qty = qty.min(notional_cap_qty);
        }

        if !signal.is_reduce_position {
            let held_notional = self
                .store
                .hget_position_status::<crate::venue::PositionStatus>(signal.maker_venue.name(), &signal.symbol)
                .await
                .unwrap_or(None)
                .and_then(|p| p.mark_price.map(|mp| p.qty * mp))
                .unwrap_or(Decimal::ZERO);
            if held_notional >= symbol_data.max_notional_per_symbol {
                log::info!("[DISPATCH] {}:{} dropped, symbol notional at cap", signal.maker_venue, signal.symbol);
                self.record_skip(&signal, "symbol_notional_cap").await;
                return;
            }
        }

        let (aligned_maker, _) = align_qty(signal.maker_venue, sym, qty);
        let (aligned_taker, _) = align_qty(signal.taker_venue, sym, qty);
        let aligned = aligned_maker.min(aligned_taker);
        if aligned <= Decimal::ZERO {
            log::info!("[DISPATCH] {}:{} dropped, aligned qty is zero", signal.maker_venue, signal.symbol);
            self.record_skip(&signal, "qty_rounds_to_zero").await;
            return;
        }

        let locked = self
            .store
            .try_lock_processing(signal.maker_venue.name(), &signal.symbol)
            .await
            .unwrap_or(false);
        if !locked {
            log::info!("[DISPATCH] {}:{} dropped, already processing", signal.maker_venue, signal.symbol);
            return;
        }

        let mut final_signal = signal;
        final_signal.maker_qty = aligned;

        let task = DealerTask {
            maker_adapter: self.adapter(final_signal.maker_venue),
            taker_adapter: self.adapter(final_signal.taker_venue),
            signal: final_signal,
            symbol: sym.clone(),
            cancel_position_timeout: symbol_data.long_threshold_data.cancel_position_timeout,
            store: self.store.clone(),
            ctx: self.ctx.child(),
            audit: self.audit.clone(),
            client_tag: self.config.client_tag.clone(),
        };
        tokio::spawn(async move {
            task.run().await;
        });
    }

    async fn record_skip(&self, signal: &OrderSignal, reason: &str) {
        let row = AuditRow {
            ts_ms: signal.ts_ms,
            symbol: signal.symbol.clone(),
            maker_venue: signal.maker_venue,
            taker_venue: signal.taker_venue,
            maker_side: signal.maker_side,
            maker_price: signal.maker_price,
            maker_qty: signal.maker_qty,
            is_reduce_position: signal.is_reduce_position,
            status: reason.to_string(),
            filled_qty: Decimal::ZERO,
            followed_qty: Decimal::ZERO,
            cancel_reason: None,
        };
        if let Err(e) = self.audit.append(row).await {
            log::warn!("[DISPATCH] audit write failed: {e}");
        }
    }
}
