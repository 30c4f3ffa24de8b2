//! Signal Dealer (§4.7) — the core per-signal state machine:
//! `OPEN -> FOLLOWING -> CLEAR -> DONE`, with a terminal `REJECTED` escape
//! from OPEN. Grounded on `cross_arbitrage/order/signal_dealer.py::deal_loop`
//! and `should_cancel_makeonly_order`. One `DealerTask` is spawned per
//! admitted signal and owns the `(maker_venue, symbol)` lock for its whole
//! lifetime, releasing it on every exit path.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rust_decimal::Decimal;

use crate::audit::{AuditLog, AuditRow};
use crate::context::CancelContext;
use crate::error::VenueError;
use crate::market_data::OrderBookSnapshot;
use crate::signal::OrderSignal;
use crate::store::Store;
use crate::symbol::Symbol;
use crate::venue::{align_qty, OrderRecord, OrderSide, OrderStatus, VenueAdapter};

async fn retry_venue<T, F, Fut>(retries: u32, mut f: F) -> Result<T, VenueError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, VenueError>>,
{
    let attempts = retries + 1;
    let mut backoff = Duration::from_millis(300);
    let cap = Duration::from_secs(10);
    let mut last_err = VenueError::Network("no attempts made".to_string());
    for attempt in 0..attempts {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                last_err = e;
                if !last_err.is_transient() || attempt + 1 == attempts {
                    break;
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(cap);
            }
        }
    }
    Err(last_err)
}

fn maker_client_id(tag: &str, ts_ms: i64) -> String {
    format!("cr{tag}mko{ts_ms}")
}

fn taker_client_id_prefix(tag: &str, ts_ms: i64) -> String {
    format!("cr{tag}mkt{ts_ms}")
}

/// §4.7 step 2's price-moved check. Grounded exactly on
/// `signal_dealer.py::should_cancel_makeonly_order`: `ob[-1]` is the worst
/// (farthest) level in the 5-level snapshot — if even that is still within
/// threshold, the whole visible book is favorable and no depth sum is
/// needed; otherwise sum the favorable levels' depth and cancel if it falls
/// short of what the follow-through still needs.
fn should_cancel_makeonly_order(
    taker_side: OrderSide,
    maker_price: Decimal,
    cancel_order_threshold: Decimal,
    taker_book: &OrderBookSnapshot,
    need_depth_qty: Decimal,
    bag_size: Decimal,
) -> bool {
    let threshold_line = maker_price / (Decimal::ONE + cancel_order_threshold);
    match taker_side {
        OrderSide::Buy => {
            let levels = &taker_book.asks;
            let Some((worst_price, _)) = levels.last().copied() else {
                return true;
            };
            if worst_price < threshold_line {
                return false;
            }
            let depth: Decimal = levels
                .iter()
                .filter(|(price, _)| *price <= threshold_line)
                .map(|(_, qty)| *qty * bag_size)
                .sum();
            depth < need_depth_qty
        }
        OrderSide::Sell => {
            let levels = &taker_book.bids;
            let Some((worst_price, _)) = levels.last().copied() else {
                return true;
            };
            if worst_price > threshold_line {
                return false;
            }
            let depth: Decimal = levels
                .iter()
                .filter(|(price, _)| *price >= threshold_line)
                .map(|(_, qty)| *qty * bag_size)
                .sum();
            depth < need_depth_qty
        }
    }
}

pub struct DealerTask {
    pub signal: OrderSignal,
    pub symbol: Symbol,
    pub cancel_position_timeout: f64,
    pub maker_adapter: Arc<dyn VenueAdapter>,
    pub taker_adapter: Arc<dyn VenueAdapter>,
    pub store: Store,
    pub ctx: CancelContext,
    pub audit: Arc<AuditLog>,
    pub client_tag: String,
}

struct FollowState {
    maker_filled_qty: Decimal,
    followed_qty: Decimal,
    taker_client_id_count: u32,
    maker_done: bool,
    cancel_by_program: bool,
}

impl DealerTask {
    pub async fn run(self) {
        let result = self.run_state_machine().await;
        if let Err(e) = result {
            log::warn!(
                "[DEALER] {}:{} ended with error: {e}",
                self.signal.maker_venue, self.signal.symbol
            );
        }
        if let Err(e) = self
            .store
            .unlock_processing(self.signal.maker_venue.name(), &self.signal.symbol)
            .await
        {
            log::warn!("[DEALER] unlock failed for {}:{}: {e}", self.signal.maker_venue, self.signal.symbol);
        }
    }

    async fn run_state_machine(&self) -> anyhow::Result<()> {
        let open_ts_ms = Utc::now().timestamp_millis();
        let maker_client_id = maker_client_id(&self.client_tag, open_ts_ms);
        let taker_prefix = taker_client_id_prefix(&self.client_tag, open_ts_ms);

        log::info!(
            "[DEALER] OPEN {}:{} side={:?} price={} qty={}",
            self.signal.maker_venue, self.signal.symbol, self.signal.maker_side, self.signal.maker_price, self.signal.maker_qty
        );

        let maker_adapter = self.maker_adapter.clone();
        let maker_native = self.symbol.instrument(self.signal.maker_venue).native_name.clone();
        let maker_side = self.signal.maker_side;
        let maker_price = self.signal.maker_price;
        let maker_qty = self.signal.maker_qty;

        let order = retry_venue(2, || {
            let maker_adapter = maker_adapter.clone();
            let client_id = maker_client_id.clone();
            let maker_native = maker_native.clone();
            async move {
                maker_adapter
                    .place_limit_post_only(&maker_native, maker_side, maker_qty, maker_price, &client_id)
                    .await
            }
        })
        .await;

        let order = match order {
            Ok(o) => o,
            Err(e) => {
                log::warn!("[DEALER] maker_order_failed {}:{}: {e}", self.signal.maker_venue, self.signal.symbol);
                return Ok(());
            }
        };

        if matches!(order.status, OrderStatus::Rejected | OrderStatus::Expired | OrderStatus::Canceled) {
            log::warn!("[DEALER] maker order came back {:?} immediately, exiting", order.status);
            return Ok(());
        }

        let mut state = FollowState {
            maker_filled_qty: order.filled,
            followed_qty: Decimal::ZERO,
            taker_client_id_count: 0,
            maker_done: false,
            cancel_by_program: false,
        };

        let open_instant = Instant::now();
        let timeout = Duration::from_secs_f64(self.cancel_position_timeout.max(0.0));
        let taker_min_amount = self.symbol.min_amount;

        loop {
            if state.maker_done {
                break;
            }

            if self.ctx.is_canceled() {
                self.issue_cancel(&order.id).await;
                state.cancel_by_program = true;
                break;
            }

            self.drain_order_events(&order.id, &mut state).await;
            if state.maker_done {
                break;
            }

            self.follow_taker(&mut state, &taker_prefix, taker_min_amount).await;

            if open_instant.elapsed() >= timeout {
                log::info!("[DEALER] timeout reached for {}:{}, canceling maker order", self.signal.maker_venue, self.signal.symbol);
                self.issue_cancel(&order.id).await;
                state.cancel_by_program = true;
                break;
            }

            if self.price_moved_against_us(&state, maker_qty).await {
                log::info!("[DEALER] price moved against maker order, canceling");
                self.issue_cancel(&order.id).await;
                state.cancel_by_program = true;
                break;
            }

            self.ctx.sleep(Duration::from_millis(300), Duration::from_millis(100)).await;
        }

        self.clear(&order, &mut state).await
    }

    async fn drain_order_events(&self, order_id: &str, state: &mut FollowState) {
        if let Ok(Some(json)) = self.store.blpop_order_status(self.signal.maker_venue.name(), order_id, 0.2).await {
            self.apply_event(&json, state);
        }
        if let Ok(rest) = self.store.lpop_order_status(self.signal.maker_venue.name(), order_id, 50).await {
            for json in rest {
                self.apply_event(&json, state);
            }
        }
    }

    fn apply_event(&self, json: &str, state: &mut FollowState) {
        match serde_json::from_str::<OrderRecord>(json) {
            Ok(event) => {
                state.maker_filled_qty = event.filled;
                if event.status == OrderStatus::Canceled {
                    state.maker_done = true;
                } else if event.status == OrderStatus::Filled {
                    state.maker_done = true;
                }
            }
            Err(e) => log::warn!("[DEALER] malformed order event skipped: {e}"),
        }
    }

    async fn follow_taker(&self, state: &mut FollowState, prefix: &str, taker_min_amount: Decimal) {
        let outstanding = state.maker_filled_qty - state.followed_qty;
        if outstanding <= Decimal::ZERO {
            return;
        }
        let (need, _) = align_qty(self.signal.taker_venue, &self.symbol, outstanding);
        if need < taker_min_amount {
            return;
        }
        state.taker_client_id_count += 1;
        let client_id = format!("{prefix}{}", state.taker_client_id_count);
        let taker_adapter = self.taker_adapter.clone();
        let taker_native = self.symbol.instrument(self.signal.taker_venue).native_name.clone();
        let side = self.signal.taker_side;
        let result = retry_venue(0, || {
            let taker_adapter = taker_adapter.clone();
            let client_id = client_id.clone();
            let taker_native = taker_native.clone();
            async move { taker_adapter.place_market(&taker_native, side, need, false, &client_id).await }
        })
        .await;
        match result {
            Ok(_) => state.followed_qty += need,
            Err(e) => log::warn!("[DEALER] taker follow-through failed, will retry next tick: {e}"),
        }
    }

    async fn price_moved_against_us(&self, state: &FollowState, order_qty: Decimal) -> bool {
        let taker_book: Option<OrderBookSnapshot> = self
            .store
            .get_latest(self.signal.taker_venue.name(), &self.signal.symbol)
            .await
            .unwrap_or(None);
        let Some(taker_book) = taker_book else {
            // Missing market data: skip the check rather than cancel blind (§7).
            return false;
        };
        let bag_size = self.symbol.instrument(self.signal.taker_venue).bag_size();
        let need_depth = order_qty - state.followed_qty;
        if need_depth <= Decimal::ZERO {
            return false;
        }
        should_cancel_makeonly_order(
            self.signal.taker_side,
            self.signal.maker_price,
            self.signal.cancel_order_threshold,
            &taker_book,
            need_depth,
            bag_size,
        )
    }

    async fn issue_cancel(&self, order_id: &str) {
        let maker_adapter = self.maker_adapter.clone();
        let maker_native = self.symbol.instrument(self.signal.maker_venue).native_name.clone();
        let order_id = order_id.to_string();
        let result: Result<(), VenueError> = retry_venue(3, || {
            let maker_adapter = maker_adapter.clone();
            let maker_native = maker_native.clone();
            let order_id = order_id.clone();
            async move { maker_adapter.cancel_order(&maker_native, &order_id).await }
        })
        .await;
        if let Err(e) = result {
            if !e.is_idempotent_success_on_cancel() {
                log::warn!("[DEALER] cancel_order failed for {order_id}: {e}");
            }
        }
    }

    async fn clear(&self, order: &OrderRecord, state: &mut FollowState) -> anyhow::Result<()> {
        if state.cancel_by_program {
            let deadline = Instant::now() + Duration::from_secs(10);
            while Instant::now() < deadline && !state.maker_done {
                self.drain_order_events(&order.id, state).await;
                if state.maker_done {
                    break;
                }
                self.ctx.sleep(Duration::from_millis(300), Duration::from_millis(100)).await;
            }
        }

        let maker_adapter = self.maker_adapter.clone();
        let maker_native = self.symbol.instrument(self.signal.maker_venue).native_name.clone();
        let order_id = order.id.clone();
        let final_order = retry_venue(3, || {
            let maker_adapter = maker_adapter.clone();
            let maker_native = maker_native.clone();
            let order_id = order_id.clone();
            async move { maker_adapter.fetch_order(&maker_native, &order_id).await }
        })
        .await
        .unwrap_or_else(|_| order.clone());

        if final_order.filled > state.followed_qty {
            let fix_qty = final_order.filled - state.followed_qty;
            let (aligned, _) = align_qty(self.signal.taker_venue, &self.symbol, fix_qty);
            if aligned > Decimal::ZERO {
                let client_id = format!("{}fix", maker_client_id(&self.client_tag, Utc::now().timestamp_millis()));
                let taker_adapter = self.taker_adapter.clone();
                let side = self.signal.taker_side;
                let taker_native = self.symbol.instrument(self.signal.taker_venue).native_name.clone();
                let result = retry_venue(3, || {
                    let taker_adapter = taker_adapter.clone();
                    let client_id = client_id.clone();
                    let taker_native = taker_native.clone();
                    async move { taker_adapter.place_market(&taker_native, side, aligned, false, &client_id).await }
                })
                .await;
                match result {
                    Ok(_) => state.followed_qty += aligned,
                    Err(e) => log::warn!("[DEALER] fix taker order failed for {}:{}: {e}", self.signal.maker_venue, self.signal.symbol),
                }
            }
        }

        let row = AuditRow {
            ts_ms: self.signal.ts_ms,
            symbol: self.signal.symbol.clone(),
            maker_venue: self.signal.maker_venue,
            taker_venue: self.signal.taker_venue,
            maker_side: self.signal.maker_side,
            maker_price: self.signal.maker_price,
            maker_qty: self.signal.maker_qty,
            is_reduce_position: self.signal.is_reduce_position,
            status: format!("{:?}", final_order.status),
            filled_qty: final_order.filled,
            followed_qty: state.followed_qty,
            cancel_reason: if state.cancel_by_program { Some("program_canceled".to_string()) } else { None },
        };
        if let Err(e) = self.audit.append(row).await {
            log::warn!("[DEALER] audit write failed: {e}");
        }

        self.ctx.sleep(Duration::from_secs(10), Duration::from_secs(1)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn book(asks: Vec<(Decimal, Decimal)>, bids: Vec<(Decimal, Decimal)>) -> OrderBookSnapshot {
        OrderBookSnapshot {
            venue: crate::venue::VenueKind::B,
            symbol: "BNB/USDT".into(),
            ts_ms: 1,
            bids,
            asks,
        }
    }

    #[test]
    fn cancels_on_empty_book() {
        let b = book(vec![], vec![(dec!(99), dec!(1))]);
        assert!(should_cancel_makeonly_order(OrderSide::Buy, dec!(100), dec!(0.001), &b, dec!(1), dec!(1)));
    }

    #[test]
    fn skips_cancel_when_entire_book_is_favorable() {
        // worst ask (last) still below threshold_line -> whole book favorable
        let b = book(vec![(dec!(99), dec!(1)), (dec!(99.5), dec!(1))], vec![]);
        let threshold_line_implied = dec!(100) / (Decimal::ONE + dec!(0.001));
        assert!(dec!(99.5) < threshold_line_implied);
        assert!(!should_cancel_makeonly_order(OrderSide::Buy, dec!(100), dec!(0.001), &b, dec!(1), dec!(1)));
    }

    #[test]
    fn cancels_when_depth_within_threshold_is_insufficient() {
        let b = book(vec![(dec!(99), dec!(0.1)), (dec!(101), dec!(5))], vec![]);
        // threshold_line ~= 99.9; only the 99 level qualifies, with depth 0.1 < need 1
        assert!(should_cancel_makeonly_order(OrderSide::Buy, dec!(100), dec!(0.001), &b, dec!(1), dec!(1)));
    }

    #[test]
    fn does_not_cancel_when_depth_within_threshold_is_sufficient() {
        let b = book(vec![(dec!(99), dec!(5)), (dec!(101), dec!(5))], vec![]);
        assert!(!should_cancel_makeonly_order(OrderSide::Buy, dec!(100), dec!(0.001), &b, dec!(1), dec!(1)));
    }

    #[test]
    fn sell_side_mirrors_buy_side_logic() {
        let b = book(vec![], vec![(dec!(101), dec!(5)), (dec!(99), dec!(5))]);
        // threshold_line ~= 100.1; worst bid (last, 99) <= threshold so not all favorable
        assert!(!should_cancel_makeonly_order(OrderSide::Sell, dec!(100), dec!(0.001), &b, dec!(1), dec!(1)));
    }
}
