//! Position Tracker (§2.5) plus the 1-second TTL position cache the signal
//! generator relies on (§4.5, §9: "a monotonic-clock TTL cache, always
//! re-derivable from the KV store"). Grounded on
//! `cross_arbitrage/order/position_status.py`: a 10s poll loop writing
//! `order:position_status`, and `order_book.py`'s `ExpireCache`-wrapped
//! `get_position`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::context::CancelContext;
use crate::store::Store;
use crate::symbol::SymbolRegistry;
use crate::venue::{PositionStatus, VenueAdapter, VenueKind};

pub struct PositionTracker {
    pub registry: Arc<SymbolRegistry>,
    pub venues: HashMap<VenueKind, Arc<dyn VenueAdapter>>,
    pub store: Store,
}

impl PositionTracker {
    /// One poll: fetch both venues' positions in full (matching the
    /// original's single `fetch_positions` call per venue) and overwrite the
    /// hash entries for every known symbol, including zero positions so a
    /// closed position is observably cleared.
    pub async fn refresh_once(&self) {
        for (venue, adapter) in &self.venues {
            match adapter.get_positions().await {
                Ok(positions) => {
                    let by_native: HashMap<String, PositionStatus> = positions.into_iter().collect();
                    for symbol in self.registry.all() {
                        let instrument = symbol.instrument(*venue);
                        let status = by_native.get(&instrument.native_name).cloned();
                        if let Some(status) = status {
                            if let Err(e) = self
                                .store
                                .hset_position_status(venue.name(), &symbol.canonical, &status)
                                .await
                            {
                                log::warn!("[POSITION] write failed for {venue}:{}: {e}", symbol.canonical);
                            }
                        }
                    }
                }
                Err(e) => {
                    log::warn!("[POSITION] refresh failed for {venue}: {e}");
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
            ctx.sleep(interval, Duration::from_secs(1)).await;
        }
    }
}

/// 1-second expiry cache on position reads (§4.5, §9). Prevents a single
/// aggregated-tick batch from re-reading the KV store on every tick while
/// still bounding staleness to one second.
pub struct PositionCache {
    store: Store,
    ttl: Duration,
    entries: Mutex<HashMap<(String, String), (Instant, Option<PositionStatus>)>>,
}

impl PositionCache {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            ttl: Duration::from_secs(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, venue: &str, symbol: &str) -> Option<PositionStatus> {
        let key = (venue.to_string(), symbol.to_string());
        {
            let cache = self.entries.lock().await;
            if let Some((fetched_at, value)) = cache.get(&key) {
                if fetched_at.elapsed() < self.ttl {
                    return value.clone();
                }
            }
        }
        let fresh = self
            .store
            .hget_position_status::<PositionStatus>(venue, symbol)
            .await
            .unwrap_or(None);
        let mut cache = self.entries.lock().await;
        cache.insert(key, (Instant::now(), fresh.clone()));
        fresh
    }
}

