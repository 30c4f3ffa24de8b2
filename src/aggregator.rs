//! Order-Book Aggregator (§4.3). One worker per `(symbol, notifier_venue)`
//! pair — two per symbol — so the aggregator fires on whichever side moved
//! without waiting a round trip for the slower venue. Grounded directly on
//! `cross_arbitrage/fetch/agg_orderbook.py::agg_orderbooks_from_redis`: block
//! on the notifier's list, then MGET both venues' latest snapshots in one
//! round trip, skip on any miss, else XADD the composite tick.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::context::CancelContext;
use crate::market_data::OrderBookSnapshot;
use crate::store::Store;
use crate::venue::VenueKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedTick {
    pub symbol: String,
    pub ts_ms: i64,
    pub trigger_venue: VenueKind,
    pub venue_a: OrderBookSnapshot,
    pub venue_b: OrderBookSnapshot,
}

/// Runs until `ctx` is canceled. `notifier_venue` is the venue whose
/// `notify:*` list this worker blocks on; it still reads both venues'
/// snapshots on wake.
pub async fn run_aggregator(
    symbol: String,
    notifier_venue: VenueKind,
    store: Store,
    ctx: CancelContext,
    stream: String,
    maxlen: usize,
) {
    log::info!("[AGG] worker started for ({symbol}, {notifier_venue})");
    let mut watchdog = tokio::time::interval(Duration::from_secs(10));
    loop {
        if ctx.is_canceled() {
            return;
        }
        tokio::select! {
            woke = store.wait_notify(notifier_venue.name(), &symbol, 1.0) => {
                match woke {
                    Ok(true) => {
                        if let Err(e) = tick_once(&symbol, notifier_venue, &store, &stream, maxlen).await {
                            log::warn!("[AGG] ({symbol}, {notifier_venue}) tick failed: {e}");
                        }
                    }
                    Ok(false) => {}
                    Err(e) => {
                        log::warn!("[AGG] ({symbol}, {notifier_venue}) notify read failed: {e}");
                        ctx.sleep(Duration::from_millis(500), Duration::from_millis(100)).await;
                    }
                }
            }
            _ = watchdog.tick() => {}
        }
    }
}

async fn tick_once(
    symbol: &str,
    notifier_venue: VenueKind,
    store: &Store,
    stream: &str,
    maxlen: usize,
) -> Result<(), crate::error::StoreError> {
    let (raw_a, raw_b) = store.get_latest_pair(symbol).await?;
    let (raw_a, raw_b) = match (raw_a, raw_b) {
        (Some(a), Some(b)) => (a, b),
        // Aggregator skips ticks with any absent venue snapshot (§7).
        _ => return Ok(()),
    };
    let venue_a: OrderBookSnapshot = serde_json::from_str(&raw_a)?;
    let venue_b: OrderBookSnapshot = serde_json::from_str(&raw_b)?;
    let ts_ms = venue_a.ts_ms.max(venue_b.ts_ms);
    let tick = AggregatedTick {
        symbol: symbol.to_string(),
        ts_ms,
        trigger_venue: notifier_venue,
        venue_a,
        venue_b,
    };
    store.xadd_tick(stream, maxlen, symbol, &tick).await?;
    Ok(())
}

/// Spawns the `2 * symbols.len()` per-pair workers (one per venue per
/// symbol), matching `agg_orderbook_mainloop`'s one-thread-per-pair layout.
pub fn spawn_all(
    symbols: Vec<String>,
    store: Store,
    ctx: CancelContext,
    stream: String,
    maxlen: usize,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();
    for symbol in symbols {
        for venue in [VenueKind::A, VenueKind::B] {
            let store = store.clone();
            let ctx = ctx.clone();
            let stream = stream.clone();
            let symbol = symbol.clone();
            handles.push(tokio::spawn(async move {
                run_aggregator(symbol, venue, store, ctx, stream, maxlen).await;
            }));
        }
    }
    handles
}
