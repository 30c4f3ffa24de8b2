//! The shared KV + streams store (§6). A thin, typed wrapper over the
//! `redis` crate mirroring the teacher's direct-`redis`-crate style
//! (`publisher.rs`, `persistence.rs`) rather than an ORM-like abstraction:
//! every method here corresponds to exactly one Redis command or a small
//! fixed sequence of them, with JSON (de)serialization at the boundary.

use std::collections::HashMap;

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult};
use rust_decimal::Decimal;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::StoreError;

#[derive(Clone)]
pub struct Store {
    conn: ConnectionManager,
}

impl Store {
    pub async fn connect(url: &str) -> RedisResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        Ok(Self { conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    // ---- latest:{venue}:{symbol} ------------------------------------
    pub async fn set_latest<T: Serialize>(&self, venue: &str, symbol: &str, value: &T) -> Result<(), StoreError> {
        let key = format!("latest:{venue}:{symbol}");
        let json = serde_json::to_string(value)?;
        let mut conn = self.conn();
        conn.set::<_, _, ()>(key, json).await?;
        Ok(())
    }

    pub async fn get_latest<T: DeserializeOwned>(&self, venue: &str, symbol: &str) -> Result<Option<T>, StoreError> {
        let key = format!("latest:{venue}:{symbol}");
        let mut conn = self.conn();
        let raw: Option<String> = conn.get(key).await?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    pub async fn get_latest_raw(&self, venue: &str, symbol: &str) -> Result<Option<String>, StoreError> {
        let key = format!("latest:{venue}:{symbol}");
        let mut conn = self.conn();
        Ok(conn.get(key).await?)
    }

    /// Atomically reads both venues' latest snapshots in a single MGET round
    /// trip (§4.3: "atomically reads the latest snapshots of both venues").
    pub async fn get_latest_pair(
        &self,
        symbol: &str,
    ) -> Result<(Option<String>, Option<String>), StoreError> {
        let key_a = format!("latest:A:{symbol}");
        let key_b = format!("latest:B:{symbol}");
        let mut conn = self.conn();
        let values: Vec<Option<String>> = conn.mget(&[key_a, key_b]).await?;
        Ok((values[0].clone(), values[1].clone()))
    }

    // ---- notify:{venue}:{symbol} — coalescing one-element marker ----
    pub async fn notify_if_empty(&self, venue: &str, symbol: &str) -> Result<(), StoreError> {
        let key = format!("notify:{venue}:{symbol}");
        let mut conn = self.conn();
        let len: i64 = conn.llen(&key).await?;
        if len == 0 {
            let _: i64 = conn.rpush(&key, 1).await?;
        }
        Ok(())
    }

    pub async fn wait_notify(&self, venue: &str, symbol: &str, timeout_secs: f64) -> Result<bool, StoreError> {
        let key = format!("notify:{venue}:{symbol}");
        let mut conn = self.conn();
        let popped: Option<(String, String)> = conn.blpop(&key, timeout_secs).await?;
        Ok(popped.is_some())
    }

    // ---- orderbook_stream --------------------------------------------
    pub async fn xadd_tick<T: Serialize>(
        &self,
        stream: &str,
        maxlen: usize,
        symbol: &str,
        tick: &T,
    ) -> Result<String, StoreError> {
        let json = serde_json::to_string(tick)?;
        let mut conn = self.conn();
        let id: String = conn
            .xadd_maxlen(
                stream,
                redis::streams::StreamMaxlen::Approx(maxlen),
                "*",
                &[(symbol, json)],
            )
            .await?;
        Ok(id)
    }

    pub async fn xread_ticks(
        &self,
        stream: &str,
        last_id: &str,
        count: usize,
        block_ms: Option<usize>,
    ) -> Result<Vec<(String, Vec<(String, String)>)>, StoreError> {
        let mut conn = self.conn();
        let mut opts = redis::streams::StreamReadOptions::default().count(count);
        if let Some(ms) = block_ms {
            opts = opts.block(ms);
        }
        let reply: redis::streams::StreamReadReply =
            conn.xread_options(&[stream], &[last_id], &opts).await?;
        let mut out = Vec::new();
        for key in reply.keys {
            for id in key.ids {
                let mut fields = Vec::new();
                for (field, value) in id.map {
                    if let redis::Value::Data(bytes) = value {
                        fields.push((field, String::from_utf8_lossy(&bytes).to_string()));
                    }
                }
                out.push((id.id, fields));
            }
        }
        Ok(out)
    }

    // ---- order_status:{venue}:{id} — per-order FIFO -------------------
    pub async fn push_order_status(&self, venue: &str, id: &str, record_json: &str) -> Result<(), StoreError> {
        let key = format!("order_status:{venue}:{id}");
        let mut conn = self.conn();
        let _: i64 = conn.rpush(key, record_json).await?;
        Ok(())
    }

    pub async fn blpop_order_status(
        &self,
        venue: &str,
        id: &str,
        timeout_secs: f64,
    ) -> Result<Option<String>, StoreError> {
        let key = format!("order_status:{venue}:{id}");
        let mut conn = self.conn();
        let popped: Option<(String, String)> = conn.blpop(&key, timeout_secs).await?;
        Ok(popped.map(|(_, v)| v))
    }

    pub async fn lpop_order_status(&self, venue: &str, id: &str, count: usize) -> Result<Vec<String>, StoreError> {
        let key = format!("order_status:{venue}:{id}");
        let mut conn = self.conn();
        let popped: Vec<String> = conn
            .lpop(key, std::num::NonZeroUsize::new(count))
            .await
            .unwrap_or_default();
        Ok(popped)
    }

    // ---- order:position_status — HASH {venue}:{symbol} -----------------
    pub async fn hset_position_status<T: Serialize>(&self, venue: &str, symbol: &str, value: &T) -> Result<(), StoreError> {
        let field = format!("{venue}:{symbol}");
        let json = serde_json::to_string(value)?;
        let mut conn = self.conn();
        conn.hset::<_, _, _, ()>("order:position_status", field, json).await?;
        Ok(())
    }

    pub async fn hget_position_status<T: DeserializeOwned>(&self, venue: &str, symbol: &str) -> Result<Option<T>, StoreError> {
        let field = format!("{venue}:{symbol}");
        let mut conn = self.conn();
        let raw: Option<String> = conn.hget("order:position_status", field).await?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    // ---- order:thresholds:{venue} — HASH {symbol} -----------------------
    pub async fn hset_thresholds<T: Serialize>(&self, venue: &str, symbol: &str, value: &T) -> Result<(), StoreError> {
        let key = format!("order:thresholds:{venue}");
        let json = serde_json::to_string(value)?;
        let mut conn = self.conn();
        conn.hset::<_, _, _, ()>(key, symbol, json).await?;
        Ok(())
    }

    pub async fn hget_thresholds<T: DeserializeOwned>(&self, venue: &str, symbol: &str) -> Result<Option<T>, StoreError> {
        let key = format!("order:thresholds:{venue}");
        let mut conn = self.conn();
        let raw: Option<String> = conn.hget(key, symbol).await?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }

    // ---- order:signal:processing — SET of "{maker_venue}:{symbol}" -----
    pub async fn try_lock_processing(&self, maker_venue: &str, symbol: &str) -> Result<bool, StoreError> {
        let member = format!("{maker_venue}:{symbol}");
        let mut conn = self.conn();
        let added: i64 = conn.sadd("order:signal:processing", member).await?;
        Ok(added == 1)
    }

    pub async fn unlock_processing(&self, maker_venue: &str, symbol: &str) -> Result<(), StoreError> {
        let member = format!("{maker_venue}:{symbol}");
        let mut conn = self.conn();
        let _: i64 = conn.srem("order:signal:processing", member).await?;
        Ok(())
    }

    pub async fn is_locked_processing(&self, maker_venue: &str, symbol: &str) -> Result<bool, StoreError> {
        let member = format!("{maker_venue}:{symbol}");
        let mut conn = self.conn();
        Ok(conn.sismember("order:signal:processing", member).await?)
    }

    /// Startup clears all locks: mutual exclusion is never held across a
    /// process restart (§5).
    pub async fn clear_processing(&self) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let _: i64 = conn.del("order:signal:processing").await?;
        Ok(())
    }

    // ---- margin:{venue} — HASH {used,free,total} ------------------------
    pub async fn hset_margin(&self, venue: &str, used: &str, free: &str, total: &str) -> Result<(), StoreError> {
        let key = format!("margin:{venue}");
        let mut conn = self.conn();
        conn.hset_multiple::<_, _, _, ()>(key, &[("used", used), ("free", free), ("total", total)])
            .await?;
        Ok(())
    }

    /// Reads back the `margin:{venue}` hash written by `hset_margin`, as
    /// `(used, free, total)`. `None` if the balance refresher hasn't
    /// populated it yet.
    pub async fn get_margin(&self, venue: &str) -> Result<Option<(Decimal, Decimal, Decimal)>, StoreError> {
        let key = format!("margin:{venue}");
        let mut conn = self.conn();
        let map: HashMap<String, String> = conn.hgetall(key).await?;
        if map.is_empty() {
            return Ok(None);
        }
        let parse = |field: &str| -> Decimal {
            map.get(field).and_then(|s| s.parse().ok()).unwrap_or(Decimal::ZERO)
        };
        Ok(Some((parse("used"), parse("free"), parse("total"))))
    }

    // ---- funding_rate:{venue}:{symbol} -----------------------------------
    pub async fn set_funding_rate<T: Serialize>(&self, venue: &str, symbol: &str, value: &T) -> Result<(), StoreError> {
        let key = format!("funding_rate:{venue}:{symbol}");
        let json = serde_json::to_string(value)?;
        let mut conn = self.conn();
        conn.set::<_, _, ()>(key, json).await?;
        Ok(())
    }

    pub async fn get_funding_rate<T: DeserializeOwned>(&self, venue: &str, symbol: &str) -> Result<Option<T>, StoreError> {
        let key = format!("funding_rate:{venue}:{symbol}");
        let mut conn = self.conn();
        let raw: Option<String> = conn.get(key).await?;
        match raw {
            Some(s) => Ok(Some(serde_json::from_str(&s)?)),
            None => Ok(None),
        }
    }
}
