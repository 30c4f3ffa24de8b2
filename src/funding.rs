//! Funding-Rate Tracker (§2.6). Fetches both venues' funding rate every few
//! minutes and computes `delta` against the previous snapshot only when the
//! new timestamp is one funding period (8h, §8 invariant 7) past the
//! previous one, or an in-window refresh (`t_new == t_prev`).

use std::sync::Arc;
use std::time::Duration;

use crate::context::CancelContext;
use crate::store::Store;
use crate::symbol::SymbolRegistry;
use crate::venue::{FundingSnapshot, VenueAdapter, VenueKind};

const FUNDING_PERIOD_MS: i64 = 8 * 60 * 60 * 1000;
const FUNDING_PERIOD_TOLERANCE_MS: i64 = 1_000;

pub struct FundingTracker {
    pub registry: Arc<SymbolRegistry>,
    pub venue: VenueKind,
    pub adapter: Arc<dyn VenueAdapter>,
    pub store: Store,
}

impl FundingTracker {
    pub async fn refresh_once(&self) {
        for symbol in self.registry.all() {
            let instrument = symbol.instrument(self.venue);
            let fresh = match self.adapter.get_funding_rate(&instrument.native_name).await {
                Ok(f) => f,
                Err(e) => {
                    log::warn!("[FUNDING] {}:{} fetch failed: {e}", self.venue, symbol.canonical);
                    continue;
                }
            };
            let previous = self
                .store
                .get_funding_rate::<FundingSnapshot>(self.venue.name(), &symbol.canonical)
                .await
                .unwrap_or(None);

            let delta = previous.as_ref().and_then(|prev| {
                let gap = fresh.ts_ms - prev.ts_ms;
                let same_window = gap == 0;
                let one_period = (gap - FUNDING_PERIOD_MS).abs() < FUNDING_PERIOD_TOLERANCE_MS;
                if same_window || one_period {
                    Some(fresh.rate - prev.rate)
                } else {
                    None
                }
            });

            let snapshot = FundingSnapshot {
                venue: self.venue,
                symbol: symbol.canonical.clone(),
                rate: fresh.rate,
                ts_ms: fresh.ts_ms,
                delta,
            };
            if let Err(e) = self
                .store
                .set_funding_rate(self.venue.name(), &symbol.canonical, &snapshot)
                .await
            {
                log::warn!("[FUNDING] write failed for {}:{}: {e}", self.venue, symbol.canonical);
            }
        }
    }

    pub async fn run(&self, ctx: CancelContext, interval: Duration) {
        loop {
            if ctx.is_canceled() {
                return;
            }
            self.refresh_once().await;
            ctx.sleep(interval, Duration::from_secs(5)).await;
        }
    }
}

/// Pure helper used by tests and by the dashboard-style CLI to sanity-check
/// a pair of timestamps without needing a live tracker.
pub fn is_same_funding_window_or_next(prev_ts_ms: i64, new_ts_ms: i64) -> bool {
    let gap = new_ts_ms - prev_ts_ms;
    gap == 0 || (gap - FUNDING_PERIOD_MS).abs() < FUNDING_PERIOD_TOLERANCE_MS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_window_accepts_exact_period() {
        assert!(is_same_funding_window_or_next(0, FUNDING_PERIOD_MS));
    }

    #[test]
    fn delta_window_accepts_same_timestamp() {
        assert!(is_same_funding_window_or_next(1_000, 1_000));
    }

    #[test]
    fn delta_window_rejects_arbitrary_gap() {
        assert!(!is_same_funding_window_or_next(0, FUNDING_PERIOD_MS / 2));
    }

    #[test]
    fn delta_window_tolerates_one_second_jitter() {
        assert!(is_same_funding_window_or_next(0, FUNDING_PERIOD_MS + 900));
        assert!(!is_same_funding_window_or_next(0, FUNDING_PERIOD_MS + 1_100));
    }
}
