//! Venue-A: an order-book exchange with integer-contract order sizing
//! (`qty.quantize(bag_size)`, §4.1) and an explicit cross-margin mode /
//! hedge-mode toggle per symbol. Modeled on the original's `okex` branch in
//! `cross_arbitrage/order/market.py` (`align_qty`, `set_leverage`,
//! `check_exchange_status`), translated to a REST adapter in the teacher's
//! `LiveExchange` idiom (`exchange.rs`): a thin `reqwest` client plus
//! hand-parsed JSON rather than a generated SDK.

use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::VenueError;
use crate::order_status::{venue_a_login_message, OrderStatusFeed};
use crate::venue::rest::{map_reqwest_err, RestVenueAdapter};
use crate::venue::signing::{canonical_query, sign_hex};
use crate::venue::{
    Balance, ExchangeHealth, ExchangeStatus, FundingSnapshot, OrderRecord, OrderSide, OrderStatus,
    OrderType, PositionDirection, PositionStatus, VenueAdapter, VenueKind,
};
use crate::market_data::{DepthFeed, OrderBookSnapshot};
use tokio_tungstenite::tungstenite::Message;

pub struct VenueA {
    rest: RestVenueAdapter,
}

impl VenueA {
    pub fn new(rest: RestVenueAdapter) -> Self {
        Self { rest }
    }

    fn timestamp_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64
    }

    fn signed_headers(&self, query: &str) -> (String, String) {
        let sig = sign_hex(self.rest.secret(), query);
        (self.rest.api_key().to_string(), sig)
    }

    fn parse_order(&self, v: &serde_json::Value, symbol: &str) -> Result<OrderRecord, VenueError> {
        let status = match v["state"].as_str().unwrap_or("live") {
            "live" => OrderStatus::New,
            "partially_filled" => OrderStatus::PartiallyFilled,
            "filled" => OrderStatus::Filled,
            "canceled" => OrderStatus::Canceled,
            "rejected" => OrderStatus::Rejected,
            _ => OrderStatus::New,
        };
        let side = match v["side"].as_str().unwrap_or("buy") {
            "sell" => OrderSide::Sell,
            _ => OrderSide::Buy,
        };
        let dec = |key: &str| -> Decimal {
            v[key]
                .as_str()
                .and_then(|s| Decimal::from_str(s).ok())
                .unwrap_or(Decimal::ZERO)
        };
        Ok(OrderRecord {
            venue: VenueKind::A,
            id: v["ordId"].as_str().unwrap_or_default().to_string(),
            client_id: v["clOrdId"].as_str().unwrap_or_default().to_string(),
            ts_ms: v["cTime"]
                .as_str()
                .and_then(|s| s.parse::<i64>().ok())
                .unwrap_or_else(Self::timestamp_ms),
            last_trade_ts_ms: v["fillTime"].as_str().and_then(|s| s.parse::<i64>().ok()),
            symbol: symbol.to_string(),
            order_type: if v["ordType"].as_str() == Some("market") {
                OrderType::Market
            } else {
                OrderType::Limit
            },
            side,
            status,
            price: dec("px"),
            avg_price: if v["avgPx"].as_str().map(|s| !s.is_empty()).unwrap_or(false) {
                Some(dec("avgPx"))
            } else {
                None
            },
            amount: dec("sz"),
            filled: dec("accFillSz"),
            cost: dec("fillNotionalUsd"),
        })
    }
}

#[async_trait]
impl VenueAdapter for VenueA {
    fn kind(&self) -> VenueKind {
        VenueKind::A
    }

    async fn get_balance(&self) -> Result<Balance, VenueError> {
        self.rest
            .retry(3, || async {
                let query = canonical_query(&[("ccy", "USDT")]);
                let (key, sig) = self.signed_headers(&query);
                let resp = self
                    .rest
                    .client
                    .get(format!("{}/api/v1/account/balance", self.rest.base_url))
                    .query(&[("ccy", "USDT")])
                    .header("API-KEY", key)
                    .header("API-SIGN", sig)
                    .send()
                    .await
                    .map_err(map_reqwest_err)?;
                let body: serde_json::Value = resp.json().await.map_err(map_reqwest_err)?;
                let d = &body["data"][0];
                Ok(Balance {
                    used: d["usedMargin"]
                        .as_str()
                        .and_then(|s| Decimal::from_str(s).ok())
                        .unwrap_or(Decimal::ZERO),
                    free: d["availBal"]
                        .as_str()
                        .and_then(|s| Decimal::from_str(s).ok())
                        .unwrap_or(Decimal::ZERO),
                    total: d["totalEq"]
                        .as_str()
                        .and_then(|s| Decimal::from_str(s).ok())
                        .unwrap_or(Decimal::ZERO),
                })
            })
            .await
    }

    async fn get_positions(&self) -> Result<Vec<(String, PositionStatus)>, VenueError> {
        self.rest
            .retry(3, || async {
                let resp = self
                    .rest
                    .client
                    .get(format!("{}/api/v1/account/positions", self.rest.base_url))
                    .send()
                    .await
                    .map_err(map_reqwest_err)?;
                let body: serde_json::Value = resp.json().await.map_err(map_reqwest_err)?;
                let mut out = Vec::new();
                if let Some(arr) = body["data"].as_array() {
                    for p in arr {
                        // Venue-A positions must be filtered to cross-margin
                        // entries only (§4.1).
                        if p["mgnMode"].as_str() != Some("cross") {
                            continue;
                        }
                        let qty = p["pos"]
                            .as_str()
                            .and_then(|s| Decimal::from_str(s).ok())
                            .unwrap_or(Decimal::ZERO)
                            .abs();
                        if qty.is_zero() {
                            continue;
                        }
                        let direction = match p["posSide"].as_str() {
                            Some("short") => PositionDirection::Short,
                            _ => PositionDirection::Long,
                        };
                        let symbol = p["instId"].as_str().unwrap_or_default().to_string();
                        out.push((
                            symbol,
                            PositionStatus {
                                direction,
                                qty,
                                avg_price: p["avgPx"].as_str().and_then(|s| Decimal::from_str(s).ok()),
                                mark_price: p["markPx"].as_str().and_then(|s| Decimal::from_str(s).ok()),
                            },
                        ));
                    }
                }
                Ok(out)
            })
            .await
    }

    async fn fetch_open_orders(&self, symbol: &str) -> Result<Vec<OrderRecord>, VenueError> {
        self.rest
            .retry(3, || async {
                let resp = self
                    .rest
                    .client
                    .get(format!("{}/api/v1/trade/orders-pending", self.rest.base_url))
                    .query(&[("instId", symbol)])
                    .send()
                    .await
                    .map_err(map_reqwest_err)?;
                let body: serde_json::Value = resp.json().await.map_err(map_reqwest_err)?;
                let mut out = Vec::new();
                if let Some(arr) = body["data"].as_array() {
                    for v in arr {
                        out.push(self.parse_order(v, symbol)?);
                    }
                }
                Ok(out)
            })
            .await
    }

    async fn fetch_order(&self, symbol: &str, order_id: &str) -> Result<OrderRecord, VenueError> {
        self.rest
            .retry(3, || async {
                let resp = self
                    .rest
                    .client
                    .get(format!("{}/api/v1/trade/order", self.rest.base_url))
                    .query(&[("instId", symbol), ("ordId", order_id)])
                    .send()
                    .await
                    .map_err(map_reqwest_err)?;
                let body: serde_json::Value = resp.json().await.map_err(map_reqwest_err)?;
                if body["data"].as_array().map(|a| a.is_empty()).unwrap_or(true) {
                    return Err(VenueError::NotFound);
                }
                self.parse_order(&body["data"][0], symbol)
            })
            .await
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), VenueError> {
        // Order-not-found / already-completed is idempotent success (§4.1, §7).
        let result = self
            .rest
            .retry(3, || async {
                let resp = self
                    .rest
                    .client
                    .post(format!("{}/api/v1/trade/cancel-order", self.rest.base_url))
                    .json(&serde_json::json!({"instId": symbol, "ordId": order_id}))
                    .send()
                    .await
                    .map_err(map_reqwest_err)?;
                let body: serde_json::Value = resp.json().await.map_err(map_reqwest_err)?;
                let code = body["data"][0]["sCode"].as_str().unwrap_or("0");
                if code == "0" {
                    Ok(())
                } else if code == "51400" || code == "51401" {
                    // order does not exist / already canceled
                    Err(VenueError::NotFound)
                } else {
                    Err(VenueError::Rejected(code.to_string()))
                }
            })
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_idempotent_success_on_cancel() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), VenueError> {
        let open = self.fetch_open_orders(symbol).await?;
        for order in open {
            self.cancel_order(symbol, &order.id).await?;
        }
        Ok(())
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), VenueError> {
        self.rest
            .retry(2, || async {
                self.rest
                    .client
                    .post(format!("{}/api/v1/account/set-leverage", self.rest.base_url))
                    .json(&serde_json::json!({"instId": symbol, "lever": leverage.to_string(), "mgnMode": "cross"}))
                    .send()
                    .await
                    .map_err(map_reqwest_err)?;
                Ok(())
            })
            .await
    }

    async fn set_margin_mode_cross(&self, symbol: &str) -> Result<(), VenueError> {
        self.rest
            .retry(2, || async {
                self.rest
                    .client
                    .post(format!("{}/api/v1/account/set-margin-mode", self.rest.base_url))
                    .json(&serde_json::json!({"instId": symbol, "mgnMode": "cross"}))
                    .send()
                    .await
                    .map_err(map_reqwest_err)?;
                Ok(())
            })
            .await
    }

    async fn disable_hedge_mode(&self) -> Result<(), VenueError> {
        self.rest
            .retry(2, || async {
                self.rest
                    .client
                    .post(format!("{}/api/v1/account/set-position-mode", self.rest.base_url))
                    .json(&serde_json::json!({"posMode": "net_mode"}))
                    .send()
                    .await
                    .map_err(map_reqwest_err)?;
                Ok(())
            })
            .await
    }

    async fn get_funding_rate(&self, symbol: &str) -> Result<FundingSnapshot, VenueError> {
        self.rest
            .retry(3, || async {
                let resp = self
                    .rest
                    .client
                    .get(format!("{}/api/v1/public/funding-rate", self.rest.base_url))
                    .query(&[("instId", symbol)])
                    .send()
                    .await
                    .map_err(map_reqwest_err)?;
                let body: serde_json::Value = resp.json().await.map_err(map_reqwest_err)?;
                let d = &body["data"][0];
                Ok(FundingSnapshot {
                    venue: VenueKind::A,
                    symbol: symbol.to_string(),
                    rate: d["fundingRate"]
                        .as_str()
                        .and_then(|s| Decimal::from_str(s).ok())
                        .unwrap_or(Decimal::ZERO),
                    ts_ms: d["fundingTime"]
                        .as_str()
                        .and_then(|s| s.parse::<i64>().ok())
                        .unwrap_or_else(Self::timestamp_ms),
                    delta: None,
                })
            })
            .await
    }

    async fn check_status(&self) -> Result<ExchangeStatus, VenueError> {
        self.rest
            .retry(3, || async {
                let resp = self
                    .rest
                    .client
                    .get(format!("{}/api/v1/system/status", self.rest.base_url))
                    .send()
                    .await
                    .map_err(map_reqwest_err)?;
                let body: serde_json::Value = resp.json().await.map_err(map_reqwest_err)?;
                let maintenance = body["data"]
                    .as_array()
                    .map(|a| a.iter().any(|s| s["serviceType"].as_str() == Some("5")))
                    .unwrap_or(false);
                Ok(ExchangeStatus {
                    ok: !maintenance,
                    status: if maintenance {
                        ExchangeHealth::Maintenance
                    } else {
                        ExchangeHealth::Ok
                    },
                    msg: None,
                })
            })
            .await
    }

    async fn place_limit_post_only(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        price: Decimal,
        client_id: &str,
    ) -> Result<OrderRecord, VenueError> {
        self.rest
            .retry(2, || async {
                let side_str = match side {
                    OrderSide::Buy => "buy",
                    OrderSide::Sell => "sell",
                };
                let resp = self
                    .rest
                    .client
                    .post(format!("{}/api/v1/trade/order", self.rest.base_url))
                    .json(&serde_json::json!({
                        "instId": symbol,
                        "side": side_str,
                        "ordType": "post_only",
                        "sz": qty.to_string(),
                        "px": price.to_string(),
                        "clOrdId": client_id,
                    }))
                    .send()
                    .await
                    .map_err(map_reqwest_err)?;
                let body: serde_json::Value = resp.json().await.map_err(map_reqwest_err)?;
                let code = body["data"][0]["sCode"].as_str().unwrap_or("1");
                if code != "0" {
                    return Err(VenueError::Rejected(
                        body["data"][0]["sMsg"].as_str().unwrap_or("rejected").to_string(),
                    ));
                }
                Ok(OrderRecord {
                    venue: VenueKind::A,
                    id: body["data"][0]["ordId"].as_str().unwrap_or_default().to_string(),
                    client_id: client_id.to_string(),
                    ts_ms: Self::timestamp_ms(),
                    last_trade_ts_ms: None,
                    symbol: symbol.to_string(),
                    order_type: OrderType::Limit,
                    side,
                    status: OrderStatus::New,
                    price,
                    avg_price: None,
                    amount: qty,
                    filled: Decimal::ZERO,
                    cost: Decimal::ZERO,
                })
            })
            .await
    }

    async fn place_market(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        reduce_only: bool,
        client_id: &str,
    ) -> Result<OrderRecord, VenueError> {
        self.rest
            .retry(2, || async {
                let side_str = match side {
                    OrderSide::Buy => "buy",
                    OrderSide::Sell => "sell",
                };
                let resp = self
                    .rest
                    .client
                    .post(format!("{}/api/v1/trade/order", self.rest.base_url))
                    .json(&serde_json::json!({
                        "instId": symbol,
                        "side": side_str,
                        "ordType": "market",
                        "sz": qty.to_string(),
                        "reduceOnly": reduce_only,
                        "clOrdId": client_id,
                    }))
                    .send()
                    .await
                    .map_err(map_reqwest_err)?;
                let body: serde_json::Value = resp.json().await.map_err(map_reqwest_err)?;
                let code = body["data"][0]["sCode"].as_str().unwrap_or("1");
                if code != "0" {
                    return Err(VenueError::Rejected(
                        body["data"][0]["sMsg"].as_str().unwrap_or("rejected").to_string(),
                    ));
                }
                Ok(OrderRecord {
                    venue: VenueKind::A,
                    id: body["data"][0]["ordId"].as_str().unwrap_or_default().to_string(),
                    client_id: client_id.to_string(),
                    ts_ms: Self::timestamp_ms(),
                    last_trade_ts_ms: None,
                    symbol: symbol.to_string(),
                    order_type: OrderType::Market,
                    side,
                    status: OrderStatus::New,
                    price: Decimal::ZERO,
                    avg_price: None,
                    amount: qty,
                    filled: Decimal::ZERO,
                    cost: Decimal::ZERO,
                })
            })
            .await
    }
}

/// Public depth-5 book feed for venue-A, matching the generic `DepthFeed`
/// plumbing in `market_data.rs`. A single batched subscribe message per
/// `connect_and_listen`'s contract (§4.2).
pub struct VenueADepthFeed {
    pub ws_url: String,
}

impl DepthFeed for VenueADepthFeed {
    fn ws_url(&self) -> String {
        self.ws_url.clone()
    }

    fn subscribe_message(&self, native_symbols: &[String]) -> Message {
        let args: Vec<serde_json::Value> = native_symbols
            .iter()
            .map(|s| serde_json::json!({"channel": "books5", "instId": s}))
            .collect();
        Message::Text(serde_json::json!({"op": "subscribe", "args": args}).to_string())
    }

    fn is_keepalive(&self, text: &str) -> bool {
        text == "pong"
    }

    fn parse(&self, text: &str) -> Vec<OrderBookSnapshot> {
        let v: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => return vec![],
        };
        let channel = v["arg"]["channel"].as_str().unwrap_or("");
        if channel != "books5" {
            return vec![];
        }
        let symbol = match v["arg"]["instId"].as_str() {
            Some(s) => s.to_string(),
            None => return vec![],
        };
        let mut out = Vec::new();
        if let Some(data) = v["data"].as_array() {
            for d in data {
                let levels = |arr: &serde_json::Value| -> Vec<(Decimal, Decimal)> {
                    arr.as_array()
                        .map(|a| {
                            a.iter()
                                .filter_map(|lvl| {
                                    let price = lvl[0].as_str().and_then(|s| Decimal::from_str(s).ok())?;
                                    let qty = lvl[1].as_str().and_then(|s| Decimal::from_str(s).ok())?;
                                    Some((price, qty))
                                })
                                .take(5)
                                .collect()
                        })
                        .unwrap_or_default()
                };
                out.push(OrderBookSnapshot {
                    venue: VenueKind::A,
                    symbol: symbol.clone(),
                    ts_ms: d["ts"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0),
                    bids: levels(&d["bids"]),
                    asks: levels(&d["asks"]),
                });
            }
        }
        out
    }
}

/// Private order-events channel for venue-A: a login frame signed over
/// `timestamp + "GET" + "/users/self/verify"`, then `{"op": "subscribe",
/// "args": [{"channel": "orders", "instType": "SWAP"}]}` (§4.9).
pub struct VenueAOrderStatusFeed {
    pub ws_url: String,
    pub api_key: String,
    pub secret: String,
    pub passphrase: String,
}

#[async_trait]
impl OrderStatusFeed for VenueAOrderStatusFeed {
    async fn ws_url(&self) -> Result<String, VenueError> {
        Ok(self.ws_url.clone())
    }

    async fn login_message(&self) -> Option<Message> {
        Some(venue_a_login_message(&self.api_key, &self.secret, &self.passphrase))
    }

    fn subscribe_message(&self) -> Option<Message> {
        Some(Message::Text(
            serde_json::json!({"op": "subscribe", "args": [{"channel": "orders", "instType": "SWAP"}]}).to_string(),
        ))
    }

    fn is_keepalive(&self, text: &str) -> bool {
        text == "pong" || text.contains("\"event\":\"login\"") || text.contains("\"event\":\"subscribe\"")
    }

    fn parse(&self, text: &str) -> Vec<OrderRecord> {
        let v: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => return vec![],
        };
        if v["arg"]["channel"].as_str() != Some("orders") {
            return vec![];
        }
        let mut out = Vec::new();
        if let Some(data) = v["data"].as_array() {
            for d in data {
                let symbol = d["instId"].as_str().unwrap_or_default().to_string();
                if let Ok(order) = parse_order_push(d, &symbol) {
                    out.push(order);
                }
            }
        }
        out
    }
}

fn parse_order_push(v: &serde_json::Value, symbol: &str) -> Result<OrderRecord, VenueError> {
    let status = match v["state"].as_str().unwrap_or("live") {
        "live" => OrderStatus::New,
        "partially_filled" => OrderStatus::PartiallyFilled,
        "filled" => OrderStatus::Filled,
        "canceled" => OrderStatus::Canceled,
        _ => OrderStatus::New,
    };
    let side = match v["side"].as_str().unwrap_or("buy") {
        "sell" => OrderSide::Sell,
        _ => OrderSide::Buy,
    };
    let dec = |key: &str| -> Decimal {
        v[key].as_str().and_then(|s| Decimal::from_str(s).ok()).unwrap_or(Decimal::ZERO)
    };
    Ok(OrderRecord {
        venue: VenueKind::A,
        id: v["ordId"].as_str().unwrap_or_default().to_string(),
        client_id: v["clOrdId"].as_str().unwrap_or_default().to_string(),
        ts_ms: v["uTime"].as_str().and_then(|s| s.parse().ok()).unwrap_or(0),
        last_trade_ts_ms: v["fillTime"].as_str().and_then(|s| s.parse().ok()),
        symbol: symbol.to_string(),
        order_type: if v["ordType"].as_str() == Some("market") { OrderType::Market } else { OrderType::Limit },
        side,
        status,
        price: dec("px"),
        avg_price: if v["avgPx"].as_str().map(|s| !s.is_empty()).unwrap_or(false) { Some(dec("avgPx")) } else { None },
        amount: dec("sz"),
        filled: dec("accFillSz"),
        cost: dec("fillNotionalUsd"),
    })
}
