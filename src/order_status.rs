//! Order-Status Stream (§4.9). Two symmetric worker trees, one per venue.
//! Each maintains a private websocket through
//! `{DISCONNECTED -> CONNECTING -> CONNECTED -> DISCONNECTING}`, normalizes
//! every order event to the canonical `OrderRecord`, and right-pushes it onto
//! `order_status:{venue}:{id}` for dealers to left-pop. Grounded on
//! `market_data.rs::connect_and_listen`'s reconnect loop, generalized from
//! public to private channels, plus venue-B's listen-key token lifecycle
//! (`cross_arbitrage/order/market.py`'s `binanceusdm` user-stream handling).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

use crate::context::CancelContext;
use crate::error::VenueError;
use crate::store::Store;
use crate::venue::rest::{map_reqwest_err, RestVenueAdapter};
use crate::venue::signing::sign_hex;
use crate::venue::{OrderRecord, VenueKind};

/// AND of both venues' connected-and-subscribed state (§4.9). The dispatcher
/// consults `is_ready()` before launching new dealers.
#[derive(Clone, Default)]
pub struct StreamReadyFlag {
    a: Arc<AtomicBool>,
    b: Arc<AtomicBool>,
}

impl StreamReadyFlag {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, venue: VenueKind, ready: bool) {
        match venue {
            VenueKind::A => self.a.store(ready, Ordering::SeqCst),
            VenueKind::B => self.b.store(ready, Ordering::SeqCst),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.a.load(Ordering::SeqCst) && self.b.load(Ordering::SeqCst)
    }
}

/// Venue-specific wiring for the private order-status channel. Mirrors
/// `market_data::DepthFeed` but for order events; `venue_a`/`venue_b` each
/// provide one.
#[async_trait]
pub trait OrderStatusFeed: Send + Sync {
    async fn ws_url(&self) -> Result<String, VenueError>;
    async fn login_message(&self) -> Option<Message>;
    fn subscribe_message(&self) -> Option<Message>;
    fn is_keepalive(&self, text: &str) -> bool;
    fn parse(&self, text: &str) -> Vec<OrderRecord>;
}

pub async fn connect_and_listen_orders(
    venue: VenueKind,
    feed: &dyn OrderStatusFeed,
    store: Store,
    ready: StreamReadyFlag,
    ctx: CancelContext,
) {
    let mut backoff = Duration::from_millis(500);
    let max_backoff = Duration::from_secs(30);

    while !ctx.is_canceled() {
        ready.set(venue, false);
        log::info!("[ORDERSTATUS] {venue} connecting");

        let url = match feed.ws_url().await {
            Ok(u) => u,
            Err(e) => {
                log::warn!("[ORDERSTATUS] {venue} could not obtain stream url: {e}, retrying in {backoff:?}");
                ctx.sleep(backoff, Duration::from_millis(200)).await;
                backoff = (backoff * 2).min(max_backoff);
                continue;
            }
        };

        let connected = tokio_tungstenite::connect_async(&url).await;
        let (mut ws, _resp) = match connected {
            Ok(pair) => pair,
            Err(e) => {
                log::warn!("[ORDERSTATUS] {venue} connect failed: {e}, retrying in {backoff:?}");
                ctx.sleep(backoff, Duration::from_millis(200)).await;
                backoff = (backoff * 2).min(max_backoff);
                continue;
            }
        };
        backoff = Duration::from_millis(500);

        if let Some(login) = feed.login_message().await {
            if let Err(e) = ws.send(login).await {
                log::warn!("[ORDERSTATUS] {venue} login send failed: {e}");
                continue;
            }
        }
        if let Some(sub) = feed.subscribe_message() {
            if let Err(e) = ws.send(sub).await {
                log::warn!("[ORDERSTATUS] {venue} subscribe failed: {e}");
                continue;
            }
        }
        ready.set(venue, true);
        log::info!("[ORDERSTATUS] {venue} connected and subscribed");

        loop {
            if ctx.is_canceled() {
                ready.set(venue, false);
                let _ = ws.close(None).await;
                return;
            }
            let next = tokio::time::timeout(Duration::from_secs(30), ws.next()).await;
            let msg = match next {
                Ok(Some(Ok(m))) => m,
                Ok(Some(Err(e))) => {
                    log::warn!("[ORDERSTATUS] {venue} ws error: {e}");
                    break;
                }
                Ok(None) => {
                    log::warn!("[ORDERSTATUS] {venue} ws closed by remote");
                    break;
                }
                Err(_) => {
                    if ws.send(Message::Ping(Vec::new())).await.is_err() {
                        log::warn!("[ORDERSTATUS] {venue} keepalive ping failed, reconnecting");
                        break;
                    }
                    continue;
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
            for record in feed.parse(&text) {
                match serde_json::to_string(&record) {
                    Ok(json) => {
                        if let Err(e) = store.push_order_status(venue.name(), &record.id, &json).await {
                            log::warn!("[ORDERSTATUS] {venue} store push failed: {e}");
                        }
                    }
                    Err(e) => log::warn!("[ORDERSTATUS] {venue} could not serialize order event: {e}"),
                }
            }
        }

        ready.set(venue, false);
        if !ctx.is_canceled() {
            ctx.sleep(Duration::from_secs(2), Duration::from_millis(200)).await;
        }
    }
}

/// Venue-B's listen-key token lifecycle: POST to create, PUT every 30
/// minutes to keep alive, DELETE on shutdown (§4.9).
pub struct ListenKeyManager {
    rest: RestVenueAdapter,
}

impl ListenKeyManager {
    pub fn new(rest: RestVenueAdapter) -> Self {
        Self { rest }
    }

    pub async fn create(&self) -> Result<String, VenueError> {
        self.rest
            .retry(3, || async {
                let resp = self
                    .rest
                    .client
                    .post(format!("{}/fapi/v1/listenKey", self.rest.base_url))
                    .header("X-MBX-APIKEY", self.rest.api_key())
                    .send()
                    .await
                    .map_err(map_reqwest_err)?;
                let body: serde_json::Value = resp.json().await.map_err(map_reqwest_err)?;
                body["listenKey"]
                    .as_str()
                    .map(|s| s.to_string())
                    .ok_or_else(|| VenueError::Rejected("listenKey missing from response".to_string()))
            })
            .await
    }

    pub async fn keepalive(&self, listen_key: &str) -> Result<(), VenueError> {
        self.rest
            .retry(2, || async {
                self.rest
                    .client
                    .put(format!("{}/fapi/v1/listenKey", self.rest.base_url))
                    .header("X-MBX-APIKEY", self.rest.api_key())
                    .query(&[("listenKey", listen_key)])
                    .send()
                    .await
                    .map_err(map_reqwest_err)?;
                Ok(())
            })
            .await
    }

    pub async fn delete(&self, listen_key: &str) -> Result<(), VenueError> {
        self.rest
            .retry(2, || async {
                self.rest
                    .client
                    .delete(format!("{}/fapi/v1/listenKey", self.rest.base_url))
                    .header("X-MBX-APIKEY", self.rest.api_key())
                    .query(&[("listenKey", listen_key)])
                    .send()
                    .await
                    .map_err(map_reqwest_err)?;
                Ok(())
            })
            .await
    }

    /// Runs until `ctx` is canceled, refreshing the token every 30 minutes
    /// and deleting it on the way out.
    pub async fn run(&self, ctx: CancelContext) -> Result<String, VenueError> {
        let listen_key = self.create().await?;
        let key_for_loop = listen_key.clone();
        tokio::spawn({
            let rest = self.rest.clone();
            let ctx = ctx.clone();
            async move {
                let mgr = ListenKeyManager::new(rest);
                loop {
                    ctx.sleep(Duration::from_secs(30 * 60), Duration::from_secs(5)).await;
                    if ctx.is_canceled() {
                        let _ = mgr.delete(&key_for_loop).await;
                        return;
                    }
                    if let Err(e) = mgr.keepalive(&key_for_loop).await {
                        log::warn!("[ORDERSTATUS] B listen-key keepalive failed: {e}");
                    }
                }
            }
        });
        Ok(listen_key)
    }
}

/// Builds an OKX-style login frame: `{"op": "login", "args": [{apiKey,
/// passphrase, timestamp, sign}]}`, signed over `timestamp + "GET" +
/// "/users/self/verify"`.
pub fn venue_a_login_message(api_key: &str, secret: &str, passphrase: &str) -> Message {
    let ts = (chrono::Utc::now().timestamp_millis() as f64 / 1000.0).to_string();
    let prehash = format!("{ts}GET/users/self/verify");
    let sign = sign_hex(secret, &prehash);
    Message::Text(
        serde_json::json!({
            "op": "login",
            "args": [{"apiKey": api_key, "passphrase": passphrase, "timestamp": ts, "sign": sign}]
        })
        .to_string(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ready_flag_requires_both_venues() {
        let flag = StreamReadyFlag::new();
        assert!(!flag.is_ready());
        flag.set(VenueKind::A, true);
        assert!(!flag.is_ready());
        flag.set(VenueKind::B, true);
        assert!(flag.is_ready());
        flag.set(VenueKind::A, false);
        assert!(!flag.is_ready());
    }
}
