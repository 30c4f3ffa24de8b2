//! Market-Data Fanout (§4.2). One streaming connection per venue, subscribed
//! in a single batch to depth-5 books for every configured symbol. Grounded
//! on the teacher's `ingestor.rs::connect_and_listen`: exponential-backoff
//! reconnect, a 30s-no-message watchdog forcing a reconnect, and a parser
//! step that drops byte-identical repeats before writing to the store.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message;

use crate::context::CancelContext;
use crate::store::Store;
use crate::venue::VenueKind;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderBookSnapshot {
    pub venue: VenueKind,
    pub symbol: String,
    pub ts_ms: i64,
    pub bids: Vec<(Decimal, Decimal)>,
    pub asks: Vec<(Decimal, Decimal)>,
}

impl OrderBookSnapshot {
    pub fn best_bid(&self) -> Option<(Decimal, Decimal)> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<(Decimal, Decimal)> {
        self.asks.first().copied()
    }
}

/// Venue-specific wire plumbing the fanout loop needs: how to subscribe and
/// how to turn one WS text message into zero or more canonical snapshots.
/// `venue_a`/`venue_b` each provide one of these; the reconnect loop below
/// is shared, matching the teacher's single generic `connect_and_listen`.
pub trait DepthFeed: Send + Sync {
    fn ws_url(&self) -> String;
    fn subscribe_message(&self, native_symbols: &[String]) -> Message;
    fn is_keepalive(&self, text: &str) -> bool;
    fn parse(&self, text: &str) -> Vec<OrderBookSnapshot>;
}

/// Runs the reconnect-and-parse loop for one venue until `ctx` is canceled.
/// `native_symbols` are the venue-native instrument names to subscribe to.
pub async fn connect_and_listen(
    venue: VenueKind,
    feed: &dyn DepthFeed,
    native_symbols: Vec<String>,
    store: Store,
    ctx: CancelContext,
) {
    let mut backoff = Duration::from_millis(500);
    let max_backoff = Duration::from_secs(30);
    let mut last_raw: HashMap<String, OrderBookSnapshot> = HashMap::new();

    while !ctx.is_canceled() {
        log::info!("[FANOUT] {venue} connecting to {}", feed.ws_url());
        let connected = tokio_tungstenite::connect_async(feed.ws_url()).await;
        let (mut ws, _resp) = match connected {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("[FANOUT] {venue} connect failed: {e}, retrying in {backoff:?}");
                ctx.sleep(backoff, Duration::from_millis(200)).await;
                backoff = (backoff * 2).min(max_backoff);
                continue;
            }
        };
        backoff = Duration::from_millis(500);

        let sub = feed.subscribe_message(&native_symbols);
        if let Err(e) = ws.send(sub).await {
            log::warn!("[FANOUT] {venue} subscribe failed: {e}");
            continue;
        }
        log::info!("[FANOUT] {venue} subscribed to {} symbols", native_symbols.len());

        loop {
            if ctx.is_canceled() {
                let _ = ws.close(None).await;
                return;
            }
            let next = tokio::time::timeout(Duration::from_secs(30), ws.next()).await;
            let msg = match next {
                Ok(Some(Ok(m))) => m,
                Ok(Some(Err(e))) => {
                    log::warn!("[FANOUT] {venue} ws error: {e}");
                    break;
                }
                Ok(None) => {
                    log::warn!("[FANOUT] {venue} ws closed by remote");
                    break;
                }
                Err(_) => {
                    log::warn!("[FANOUT] {venue} no message in 30s, reconnecting");
                    break;
                }
            };
            let text = match msg {
                Message::Text(t) => t,
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(_) => break,
                _ => continue,
            };
            if feed.is_keepalive(&text) {
                continue;
            }
            for snapshot in feed.parse(&text) {
                // Drop byte-identical repeats (§4.2); WS producers often
                // re-broadcast an unchanged top-5.
                if last_raw.get(&snapshot.symbol) == Some(&snapshot) {
                    continue;
                }
                if let Err(e) = store.set_latest(venue.name(), &snapshot.symbol, &snapshot).await {
                    log::warn!("[FANOUT] {venue} store write failed: {e}");
                    continue;
                }
                if let Err(e) = store.notify_if_empty(venue.name(), &snapshot.symbol).await {
                    log::warn!("[FANOUT] {venue} notify failed: {e}");
                }
                last_raw.insert(snapshot.symbol.clone(), snapshot);
            }
        }

        if !ctx.is_canceled() {
            ctx.sleep(Duration::from_secs(2), Duration::from_millis(200)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn snap(ts: i64, bid: Decimal) -> OrderBookSnapshot {
        OrderBookSnapshot {
            venue: VenueKind::A,
            symbol: "BNB/USDT".into(),
            ts_ms: ts,
            bids: vec![(bid, dec!(1))],
            asks: vec![(bid + dec!(0.01), dec!(1))],
        }
    }

    #[test]
    fn identical_snapshots_are_equal_for_dedup() {
        let a = snap(1, dec!(100));
        let b = snap(2, dec!(100));
        // ts differs but this test only checks the dedup key the loop above
        // actually uses: full snapshot equality including ts. A real feed's
        // parser sets ts from the message, so an unchanged top-5 at a new ts
        // is NOT byte-identical unless the venue repeats the same payload
        // (including ts) verbatim, which is the case this guards against.
        assert_ne!(a, b);
        assert_eq!(a, snap(1, dec!(100)));
    }

    #[test]
    fn best_bid_ask_read_first_level() {
        let s = snap(1, dec!(100));
        assert_eq!(s.best_bid(), Some((dec!(100), dec!(1))));
        assert_eq!(s.best_ask(), Some((dec!(100.01), dec!(1))));
    }
}
