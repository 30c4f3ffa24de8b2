//! Exchange Health Monitor (§2 item 8, §7 "venue under maintenance"). Polls
//! both venues' status endpoints every 30-120s and flips the process-wide
//! `order_mode` to `maintain` when either reports unhealthy, restoring the
//! mode that was active before maintenance once both recover. `maintain`
//! always wins over an operator-set `pending`/`reduce_only`/`normal` value,
//! and is never itself the remembered value, so a recovery never leaves the
//! context stuck in `maintain`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::context::{CancelContext, OrderMode};
use crate::venue::{ExchangeHealth, VenueAdapter, VenueKind};

pub struct HealthMonitor {
    pub venues: HashMap<VenueKind, Arc<dyn VenueAdapter>>,
    pub ctx: CancelContext,
    /// Mode to restore once every venue recovers; the operator-configured
    /// mode at startup, updated whenever a non-`maintain` mode is observed.
    remembered: Mutex<OrderMode>,
}

impl HealthMonitor {
    pub fn new(venues: HashMap<VenueKind, Arc<dyn VenueAdapter>>, ctx: CancelContext) -> Self {
        let remembered = ctx.order_mode();
        Self {
            venues,
            ctx,
            remembered: Mutex::new(remembered),
        }
    }

    pub async fn check_once(&self) {
        let mut any_unhealthy = false;
        for (venue, adapter) in &self.venues {
            match adapter.check_status().await {
                Ok(status) if status.ok && status.status == ExchangeHealth::Ok => {}
                Ok(status) => {
                    any_unhealthy = true;
                    log::warn!("[HEALTH] {venue} reports {:?}: {:?}", status.status, status.msg);
                }
                Err(e) => {
                    any_unhealthy = true;
                    log::warn!("[HEALTH] {venue} status probe failed: {e}");
                }
            }
        }

        let current = self.ctx.order_mode();
        if any_unhealthy {
            if current != OrderMode::Maintain {
                *self.remembered.lock().await = current;
                log::warn!("[HEALTH] entering maintain mode (was {current:?})");
                self.ctx.set_order_mode(OrderMode::Maintain);
            }
        } else if current == OrderMode::Maintain {
            let restore = *self.remembered.lock().await;
            log::info!("[HEALTH] venues recovered, restoring {restore:?}");
            self.ctx.set_order_mode(restore);
        } else if current != OrderMode::Maintain {
            *self.remembered.lock().await = current;
        }
    }

    pub async fn run(&self, interval: Duration) {
        loop {
            if self.ctx.is_canceled() {
                return;
            }
            self.check_once().await;
            self.ctx.sleep(interval, Duration::from_secs(5)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use std::sync::atomic::{AtomicBool, Ordering};
    use crate::error::VenueError;
    use crate::venue::{
        Balance, ExchangeStatus, FundingSnapshot, OrderRecord, OrderSide, PositionStatus,
    };

    struct MockAdapter {
        kind: VenueKind,
        healthy: AtomicBool,
    }

    #[async_trait]
    impl VenueAdapter for MockAdapter {
        fn kind(&self) -> VenueKind {
            self.kind
        }
        async fn get_balance(&self) -> Result<Balance, VenueError> {
            unimplemented!()
        }
        async fn get_positions(&self) -> Result<Vec<(String, PositionStatus)>, VenueError> {
            unimplemented!()
        }
        async fn fetch_open_orders(&self, _symbol: &str) -> Result<Vec<OrderRecord>, VenueError> {
            unimplemented!()
        }
        async fn fetch_order(&self, _symbol: &str, _order_id: &str) -> Result<OrderRecord, VenueError> {
            unimplemented!()
        }
        async fn cancel_order(&self, _symbol: &str, _order_id: &str) -> Result<(), VenueError> {
            unimplemented!()
        }
        async fn cancel_all_orders(&self, _symbol: &str) -> Result<(), VenueError> {
            unimplemented!()
        }
        async fn set_leverage(&self, _symbol: &str, _leverage: u32) -> Result<(), VenueError> {
            unimplemented!()
        }
        async fn set_margin_mode_cross(&self, _symbol: &str) -> Result<(), VenueError> {
            unimplemented!()
        }
        async fn disable_hedge_mode(&self) -> Result<(), VenueError> {
            unimplemented!()
        }
        async fn get_funding_rate(&self, _symbol: &str) -> Result<FundingSnapshot, VenueError> {
            unimplemented!()
        }
        async fn check_status(&self) -> Result<ExchangeStatus, VenueError> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(ExchangeStatus { ok: true, status: ExchangeHealth::Ok, msg: None })
            } else {
                Ok(ExchangeStatus { ok: false, status: ExchangeHealth::Maintenance, msg: Some("down for maintenance".into()) })
            }
        }
        async fn place_limit_post_only(
            &self,
            _symbol: &str,
            _side: OrderSide,
            _qty: Decimal,
            _price: Decimal,
            _client_id: &str,
        ) -> Result<OrderRecord, VenueError> {
            unimplemented!()
        }
        async fn place_market(
            &self,
            _symbol: &str,
            _side: OrderSide,
            _qty: Decimal,
            _reduce_only: bool,
            _client_id: &str,
        ) -> Result<OrderRecord, VenueError> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn unhealthy_venue_flips_to_maintain_and_remembers_prior_mode() {
        let b = Arc::new(MockAdapter { kind: VenueKind::B, healthy: AtomicBool::new(true) });
        let a = Arc::new(MockAdapter { kind: VenueKind::A, healthy: AtomicBool::new(false) });
        let mut venues: HashMap<VenueKind, Arc<dyn VenueAdapter>> = HashMap::new();
        venues.insert(VenueKind::A, a.clone());
        venues.insert(VenueKind::B, b);

        let ctx = CancelContext::new(OrderMode::ReduceOnly);
        let monitor = HealthMonitor::new(venues, ctx.clone());

        monitor.check_once().await;
        assert_eq!(ctx.order_mode(), OrderMode::Maintain);

        a.healthy.store(true, Ordering::SeqCst);
        monitor.check_once().await;
        assert_eq!(ctx.order_mode(), OrderMode::ReduceOnly);
    }

    #[tokio::test]
    async fn healthy_venues_leave_mode_untouched() {
        let a = Arc::new(MockAdapter { kind: VenueKind::A, healthy: AtomicBool::new(true) });
        let b = Arc::new(MockAdapter { kind: VenueKind::B, healthy: AtomicBool::new(true) });
        let mut venues: HashMap<VenueKind, Arc<dyn VenueAdapter>> = HashMap::new();
        venues.insert(VenueKind::A, a);
        venues.insert(VenueKind::B, b);

        let ctx = CancelContext::new(OrderMode::Normal);
        let monitor = HealthMonitor::new(venues, ctx.clone());
        monitor.check_once().await;
        assert_eq!(ctx.order_mode(), OrderMode::Normal);
    }
}
