//! Balance Refresher (§2 item 9, §5 "20s cadence"). Polls each venue's
//! account balance and republishes it as the `margin:{venue}` hash that the
//! dispatcher's notional-cap check reads. Grounded on
//! `cross_arbitrage/order/balance_refresh.py`'s poll-and-overwrite loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::context::CancelContext;
use crate::store::Store;
use crate::venue::{VenueAdapter, VenueKind};

pub struct BalanceRefresher {
    pub venues: HashMap<VenueKind, Arc<dyn VenueAdapter>>,
    pub store: Store,
}

impl BalanceRefresher {
    pub async fn refresh_once(&self) {
        for (venue, adapter) in &self.venues {
            match adapter.get_balance().await {
                Ok(balance) => {
                    if let Err(e) = self
                        .store
                        .hset_margin(
                            venue.name(),
                            &balance.used.to_string(),
                            &balance.free.to_string(),
                            &balance.total.to_string(),
                        )
                        .await
                    {
                        log::warn!("[BALANCE] write failed for {venue}: {e}");
                    }
                }
                Err(e) => {
                    log::warn!("[BALANCE] refresh failed for {venue}: {e}");
                }
            }
        }
    }

    pub async fn run(&self, ctx: CancelContext, interval: Duration) {
        loop {
            if ctx.is_canceled() {
                return;
            }
            self.refresh_once().await;
            ctx.sleep(interval, Duration::from_secs(2)).await;
        }
    }
}
