//! Venue-B: a contract-sized exchange with fractional base-unit precision
//! (`round_down(qty / multiplier, precision) * multiplier`, §4.1). Modeled on
//! the original's `binanceusdm` branch in `cross_arbitrage/order/market.py`
//! and `position_status.py` (single-shot `fetch_positions`, `contracts *
//! contract_size` conversion), in the teacher's REST-adapter idiom.

use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::VenueError;
use crate::order_status::{ListenKeyManager, OrderStatusFeed};
use crate::venue::rest::{map_reqwest_err, RestVenueAdapter};
use crate::venue::signing::sign_hex;
use crate::venue::{
    Balance, ExchangeHealth, ExchangeStatus, FundingSnapshot, OrderRecord, OrderSide, OrderStatus,
    OrderType, PositionDirection, PositionStatus, VenueAdapter, VenueKind,
};
use crate::market_data::{DepthFeed, OrderBookSnapshot};
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::tungstenite::Message;

pub struct VenueB {
    rest: RestVenueAdapter,
}

impl VenueB {
    pub fn new(rest: RestVenueAdapter) -> Self {
        Self { rest }
    }

    fn timestamp_ms() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64
    }

    fn signed_query(&self, mut params: Vec<(String, String)>) -> Vec<(String, String)> {
        params.push(("timestamp".to_string(), Self::timestamp_ms().to_string()));
        let query = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let sig = sign_hex(self.rest.secret(), &query);
        params.push(("signature".to_string(), sig));
        params
    }

    fn parse_order(&self, v: &serde_json::Value) -> Result<OrderRecord, VenueError> {
        let status = match v["status"].as_str().unwrap_or("NEW") {
            "NEW" => OrderStatus::New,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "FILLED" => OrderStatus::Filled,
            "CANCELED" => OrderStatus::Canceled,
            "REJECTED" => OrderStatus::Rejected,
            "EXPIRED" => OrderStatus::Expired,
            _ => OrderStatus::New,
        };
        let side = match v["side"].as_str().unwrap_or("BUY") {
            "SELL" => OrderSide::Sell,
            _ => OrderSide::Buy,
        };
        let dec = |key: &str| -> Decimal {
            v[key]
                .as_str()
                .and_then(|s| Decimal::from_str(s).ok())
                .or_else(|| v[key].as_f64().and_then(|f| Decimal::from_str(&f.to_string()).ok()))
                .unwrap_or(Decimal::ZERO)
        };
        Ok(OrderRecord {
            venue: VenueKind::B,
            id: v["orderId"]
                .as_i64()
                .map(|i| i.to_string())
                .unwrap_or_default(),
            client_id: v["clientOrderId"].as_str().unwrap_or_default().to_string(),
            ts_ms: v["updateTime"].as_i64().unwrap_or_else(Self::timestamp_ms),
            last_trade_ts_ms: None,
            symbol: v["symbol"].as_str().unwrap_or_default().to_string(),
            order_type: if v["type"].as_str() == Some("MARKET") {
                OrderType::Market
            } else {
                OrderType::Limit
            },
            side,
            status,
            price: dec("price"),
            avg_price: if dec("avgPrice").is_zero() { None } else { Some(dec("avgPrice")) },
            amount: dec("origQty"),
            filled: dec("executedQty"),
            cost: dec("cumQuote"),
        })
    }
}

#[async_trait]
impl VenueAdapter for VenueB {
    fn kind(&self) -> VenueKind {
        VenueKind::B
    }

    async fn get_balance(&self) -> Result<Balance, VenueError> {
        self.rest
            .retry(3, || async {
                let params = self.signed_query(vec![]);
                let resp = self
                    .rest
                    .client
                    .get(format!("{}/fapi/v2/account", self.rest.base_url))
                    .query(&params)
                    .header("X-MBX-APIKEY", self.rest.api_key())
                    .send()
                    .await
                    .map_err(map_reqwest_err)?;
                let body: serde_json::Value = resp.json().await.map_err(map_reqwest_err)?;
                let dec = |key: &str| -> Decimal {
                    body[key]
                        .as_str()
                        .and_then(|s| Decimal::from_str(s).ok())
                        .unwrap_or(Decimal::ZERO)
                };
                let total = dec("totalMarginBalance");
                let free = dec("availableBalance");
                Ok(Balance {
                    used: total - free,
                    free,
                    total,
                })
            })
            .await
    }

    async fn get_positions(&self) -> Result<Vec<(String, PositionStatus)>, VenueError> {
        self.rest
            .retry(3, || async {
                let params = self.signed_query(vec![]);
                let resp = self
                    .rest
                    .client
                    .get(format!("{}/fapi/v2/positionRisk", self.rest.base_url))
                    .query(&params)
                    .header("X-MBX-APIKEY", self.rest.api_key())
                    .send()
                    .await
                    .map_err(map_reqwest_err)?;
                let body: serde_json::Value = resp.json().await.map_err(map_reqwest_err)?;
                let mut out = Vec::new();
                if let Some(arr) = body.as_array() {
                    for p in arr {
                        let amt = p["positionAmt"]
                            .as_str()
                            .and_then(|s| Decimal::from_str(s).ok())
                            .unwrap_or(Decimal::ZERO);
                        if amt.is_zero() {
                            continue;
                        }
                        let direction = if amt.is_sign_positive() {
                            PositionDirection::Long
                        } else {
                            PositionDirection::Short
                        };
                        out.push((
                            p["symbol"].as_str().unwrap_or_default().to_string(),
                            PositionStatus {
                                direction,
                                qty: amt.abs(),
                                avg_price: p["entryPrice"].as_str().and_then(|s| Decimal::from_str(s).ok()),
                                mark_price: p["markPrice"].as_str().and_then(|s| Decimal::from_str(s).ok()),
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
                let params = self.signed_query(vec![("symbol".to_string(), symbol.to_string())]);
                let resp = self
                    .rest
                    .client
                    .get(format!("{}/fapi/v1/openOrders", self.rest.base_url))
                    .query(&params)
                    .header("X-MBX-APIKEY", self.rest.api_key())
                    .send()
                    .await
                    .map_err(map_reqwest_err)?;
                let body: serde_json::Value = resp.json().await.map_err(map_reqwest_err)?;
                let mut out = Vec::new();
                if let Some(arr) = body.as_array() {
                    for v in arr {
                        out.push(self.parse_order(v)?);
                    }
                }
                Ok(out)
            })
            .await
    }

    async fn fetch_order(&self, symbol: &str, order_id: &str) -> Result<OrderRecord, VenueError> {
        self.rest
            .retry(3, || async {
                let params = self.signed_query(vec![
                    ("symbol".to_string(), symbol.to_string()),
                    ("orderId".to_string(), order_id.to_string()),
                ]);
                let resp = self
                    .rest
                    .client
                    .get(format!("{}/fapi/v1/order", self.rest.base_url))
                    .query(&params)
                    .header("X-MBX-APIKEY", self.rest.api_key())
                    .send()
                    .await
                    .map_err(map_reqwest_err)?;
                if resp.status().as_u16() == 400 {
                    return Err(VenueError::NotFound);
                }
                let body: serde_json::Value = resp.json().await.map_err(map_reqwest_err)?;
                self.parse_order(&body)
            })
            .await
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), VenueError> {
        let result = self
            .rest
            .retry(3, || async {
                let params = self.signed_query(vec![
                    ("symbol".to_string(), symbol.to_string()),
                    ("orderId".to_string(), order_id.to_string()),
                ]);
                let resp = self
                    .rest
                    .client
                    .delete(format!("{}/fapi/v1/order", self.rest.base_url))
                    .query(&params)
                    .header("X-MBX-APIKEY", self.rest.api_key())
                    .send()
                    .await
                    .map_err(map_reqwest_err)?;
                let code = resp.status().as_u16();
                if code == 200 {
                    Ok(())
                } else if code == 400 || code == 404 {
                    Err(VenueError::NotFound)
                } else {
                    Err(VenueError::Rejected(format!("status {code}")))
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
        self.rest
            .retry(3, || async {
                let params = self.signed_query(vec![("symbol".to_string(), symbol.to_string())]);
                self.rest
                    .client
                    .delete(format!("{}/fapi/v1/allOpenOrders", self.rest.base_url))
                    .query(&params)
                    .header("X-MBX-APIKEY", self.rest.api_key())
                    .send()
                    .await
                    .map_err(map_reqwest_err)?;
                Ok(())
            })
            .await
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), VenueError> {
        self.rest
            .retry(2, || async {
                let params = self.signed_query(vec![
                    ("symbol".to_string(), symbol.to_string()),
                    ("leverage".to_string(), leverage.to_string()),
                ]);
                self.rest
                    .client
                    .post(format!("{}/fapi/v1/leverage", self.rest.base_url))
                    .query(&params)
                    .header("X-MBX-APIKEY", self.rest.api_key())
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
                let params = self.signed_query(vec![
                    ("symbol".to_string(), symbol.to_string()),
                    ("marginType".to_string(), "CROSSED".to_string()),
                ]);
                let resp = self
                    .rest
                    .client
                    .post(format!("{}/fapi/v1/marginType", self.rest.base_url))
                    .query(&params)
                    .header("X-MBX-APIKEY", self.rest.api_key())
                    .send()
                    .await
                    .map_err(map_reqwest_err)?;
                // "no need to change margin type" is a benign 400, treat as success.
                if resp.status().is_success() || resp.status().as_u16() == 400 {
                    Ok(())
                } else {
                    Err(VenueError::Rejected(format!("status {}", resp.status())))
                }
            })
            .await
    }

    async fn disable_hedge_mode(&self) -> Result<(), VenueError> {
        self.rest
            .retry(2, || async {
                let params = self.signed_query(vec![("dualSidePosition".to_string(), "false".to_string())]);
                let resp = self
                    .rest
                    .client
                    .post(format!("{}/fapi/v1/positionSide/dual", self.rest.base_url))
                    .query(&params)
                    .header("X-MBX-APIKEY", self.rest.api_key())
                    .send()
                    .await
                    .map_err(map_reqwest_err)?;
                if resp.status().is_success() || resp.status().as_u16() == 400 {
                    Ok(())
                } else {
                    Err(VenueError::Rejected(format!("status {}", resp.status())))
                }
            })
            .await
    }

    async fn get_funding_rate(&self, symbol: &str) -> Result<FundingSnapshot, VenueError> {
        self.rest
            .retry(3, || async {
                let resp = self
                    .rest
                    .client
                    .get(format!("{}/fapi/v1/premiumIndex", self.rest.base_url))
                    .query(&[("symbol", symbol)])
                    .send()
                    .await
                    .map_err(map_reqwest_err)?;
                let body: serde_json::Value = resp.json().await.map_err(map_reqwest_err)?;
                Ok(FundingSnapshot {
                    venue: VenueKind::B,
                    symbol: symbol.to_string(),
                    rate: body["lastFundingRate"]
                        .as_str()
                        .and_then(|s| Decimal::from_str(s).ok())
                        .unwrap_or(Decimal::ZERO),
                    ts_ms: body["nextFundingTime"].as_i64().unwrap_or_else(Self::timestamp_ms),
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
                    .get(format!("{}/fapi/v1/ping", self.rest.base_url))
                    .send()
                    .await
                    .map_err(map_reqwest_err)?;
                Ok(ExchangeStatus {
                    ok: resp.status().is_success(),
                    status: if resp.status().is_success() {
                        ExchangeHealth::Ok
                    } else {
                        ExchangeHealth::Maintenance
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
                    OrderSide::Buy => "BUY",
                    OrderSide::Sell => "SELL",
                };
                let params = self.signed_query(vec![
                    ("symbol".to_string(), symbol.to_string()),
                    ("side".to_string(), side_str.to_string()),
                    ("type".to_string(), "LIMIT".to_string()),
                    ("timeInForce".to_string(), "GTX".to_string()), // post-only
                    ("quantity".to_string(), qty.to_string()),
                    ("price".to_string(), price.to_string()),
                    ("newClientOrderId".to_string(), client_id.to_string()),
                ]);
                let resp = self
                    .rest
                    .client
                    .post(format!("{}/fapi/v1/order", self.rest.base_url))
                    .query(&params)
                    .header("X-MBX-APIKEY", self.rest.api_key())
                    .send()
                    .await
                    .map_err(map_reqwest_err)?;
                if !resp.status().is_success() {
                    let body: serde_json::Value = resp.json().await.unwrap_or_default();
                    return Err(VenueError::Rejected(
                        body["msg"].as_str().unwrap_or("rejected").to_string(),
                    ));
                }
                let body: serde_json::Value = resp.json().await.map_err(map_reqwest_err)?;
                self.parse_order(&body)
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
                    OrderSide::Buy => "BUY",
                    OrderSide::Sell => "SELL",
                };
                let params = self.signed_query(vec![
                    ("symbol".to_string(), symbol.to_string()),
                    ("side".to_string(), side_str.to_string()),
                    ("type".to_string(), "MARKET".to_string()),
                    ("quantity".to_string(), qty.to_string()),
                    ("reduceOnly".to_string(), reduce_only.to_string()),
                    ("newClientOrderId".to_string(), client_id.to_string()),
                ]);
                let resp = self
                    .rest
                    .client
                    .post(format!("{}/fapi/v1/order", self.rest.base_url))
                    .query(&params)
                    .header("X-MBX-APIKEY", self.rest.api_key())
                    .send()
                    .await
                    .map_err(map_reqwest_err)?;
                if !resp.status().is_success() {
                    let body: serde_json::Value = resp.json().await.unwrap_or_default();
                    return Err(VenueError::Rejected(
                        body["msg"].as_str().unwrap_or("rejected").to_string(),
                    ));
                }
                let body: serde_json::Value = resp.json().await.map_err(map_reqwest_err)?;
                self.parse_order(&body)
            })
            .await
    }
}

/// Public depth-5 book feed for venue-B: one combined-stream websocket
/// subscribed in a single batch, mirroring the teacher's
/// `wss://.../stream?streams=...` combined-stream convention.
pub struct VenueBDepthFeed {
    pub ws_base_url: String,
}

impl DepthFeed for VenueBDepthFeed {
    fn ws_url(&self) -> String {
        self.ws_base_url.clone()
    }

    fn subscribe_message(&self, native_symbols: &[String]) -> Message {
        let params: Vec<String> = native_symbols
            .iter()
            .map(|s| format!("{}@depth5@100ms", s.to_lowercase()))
            .collect();
        Message::Text(
            serde_json::json!({"method": "SUBSCRIBE", "params": params, "id": 1}).to_string(),
        )
    }

    fn is_keepalive(&self, text: &str) -> bool {
        text.contains("\"result\":null")
    }

    fn parse(&self, text: &str) -> Vec<OrderBookSnapshot> {
        let v: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => return vec![],
        };
        let data = if v.get("data").is_some() { &v["data"] } else { &v };
        let symbol = match data["s"].as_str() {
            Some(s) => s.to_string(),
            None => return vec![],
        };
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
        vec![OrderBookSnapshot {
            venue: VenueKind::B,
            symbol,
            ts_ms: data["E"].as_i64().unwrap_or(0),
            bids: levels(&data["b"]),
            asks: levels(&data["a"]),
        }]
    }
}

/// Private order-events channel for venue-B: the combined-stream websocket
/// keyed by a listen-key token (`wss://.../ws/{listenKey}`), refreshed via
/// `ListenKeyManager` (§4.9).
pub struct VenueBOrderStatusFeed {
    pub ws_base_url: String,
    pub listen_key_mgr: ListenKeyManager,
    pub ctx: crate::context::CancelContext,
    listen_key: AsyncMutex<Option<String>>,
}

impl VenueBOrderStatusFeed {
    pub fn new(ws_base_url: String, listen_key_mgr: ListenKeyManager, ctx: crate::context::CancelContext) -> Self {
        Self {
            ws_base_url,
            listen_key_mgr,
            ctx,
            listen_key: AsyncMutex::new(None),
        }
    }
}

#[async_trait]
impl OrderStatusFeed for VenueBOrderStatusFeed {
    async fn ws_url(&self) -> Result<String, VenueError> {
        let mut guard = self.listen_key.lock().await;
        if guard.is_none() {
            *guard = Some(self.listen_key_mgr.run(self.ctx.clone()).await?);
        }
        Ok(format!("{}/{}", self.ws_base_url, guard.as_ref().unwrap()))
    }

    async fn login_message(&self) -> Option<Message> {
        None
    }

    fn subscribe_message(&self) -> Option<Message> {
        None
    }

    fn is_keepalive(&self, text: &str) -> bool {
        text.contains("\"e\":\"listenKeyExpired\"")
    }

    fn parse(&self, text: &str) -> Vec<OrderRecord> {
        let v: serde_json::Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => return vec![],
        };
        if v["e"].as_str() != Some("ORDER_TRADE_UPDATE") {
            return vec![];
        }
        let o = &v["o"];
        match parse_order_push(o) {
            Ok(order) => vec![order],
            Err(_) => vec![],
        }
    }
}

fn parse_order_push(v: &serde_json::Value) -> Result<OrderRecord, VenueError> {
    let status = match v["X"].as_str().unwrap_or("NEW") {
        "NEW" => OrderStatus::New,
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" => OrderStatus::Canceled,
        "REJECTED" => OrderStatus::Rejected,
        "EXPIRED" => OrderStatus::Expired,
        _ => OrderStatus::New,
    };
    let side = match v["S"].as_str().unwrap_or("BUY") {
        "SELL" => OrderSide::Sell,
        _ => OrderSide::Buy,
    };
    let dec = |key: &str| -> Decimal {
        v[key]
            .as_str()
            .and_then(|s| Decimal::from_str(s).ok())
            .unwrap_or(Decimal::ZERO)
    };
    Ok(OrderRecord {
        venue: VenueKind::B,
        id: v["i"].as_i64().map(|i| i.to_string()).unwrap_or_default(),
        client_id: v["c"].as_str().unwrap_or_default().to_string(),
        ts_ms: v["T"].as_i64().unwrap_or(0),
        last_trade_ts_ms: None,
        symbol: v["s"].as_str().unwrap_or_default().to_string(),
        order_type: if v["o"].as_str() == Some("MARKET") { OrderType::Market } else { OrderType::Limit },
        side,
        status,
        price: dec("p"),
        avg_price: if v["ap"].as_str().map(|s| s != "0").unwrap_or(false) { Some(dec("ap")) } else { None },
        amount: dec("q"),
        filled: dec("z"),
        cost: dec("Z"),
    })
}
