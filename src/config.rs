use std::collections::HashMap;
use std::path::Path;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::context::OrderMode;
use crate::error::ConfigError;

/// Mirrors `cross_arbitrage/order/config.py::OrderConfig` defaults exactly
/// (§6). Loaded by merging `common.json` then `{env}.json` in order, the way
/// the original's `get_config` does, then validated once.
fn default_increase() -> Decimal {
    dec!(0.0012)
}
fn default_decrease() -> Decimal {
    dec!(0.0002)
}
fn default_cancel_increase_ratio() -> Decimal {
    dec!(0.75)
}
fn default_cancel_decrease_ratio() -> Decimal {
    dec!(0.25)
}
fn default_cancel_position_timeout() -> f64 {
    120.0
}
fn default_max_notional_per_order() -> Decimal {
    dec!(20)
}
fn default_max_notional_per_symbol() -> Decimal {
    dec!(100)
}
fn default_max_used_margin() -> Decimal {
    dec!(0.9)
}
fn default_symbol_leverage() -> u32 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub url: String,
    #[serde(default = "default_orderbook_stream")]
    pub orderbook_stream: String,
    #[serde(default = "default_orderbook_stream_size")]
    pub orderbook_stream_size: usize,
}

fn default_orderbook_stream() -> String {
    "orderbook_stream".to_string()
}
fn default_orderbook_stream_size() -> usize {
    2_000_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_dir")]
    pub dir: String,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_dir() -> String {
    "logs".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: default_log_dir(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub http_proxy: Option<String>,
    pub https_proxy: Option<String>,
}

/// `exchanges.{name}.*` credentials. Values here are placeholders resolved
/// from `.env` the way the teacher resolves `HL_ADDRESS`/`HL_PRIVATE_KEY` via
/// `dotenvy`; a literal secret in a JSON config file is never expected, but
/// the field is typed `Option<String>` so `check-config` can report which
/// exchange is missing credentials without panicking.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExchangeCreds {
    pub api_key: Option<String>,
    pub secret: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdData {
    #[serde(default = "default_increase")]
    pub increase_position_threshold: Decimal,
    #[serde(default = "default_decrease")]
    pub decrease_position_threshold: Decimal,
    /// Explicit absolute cancel lines (§6). When set, used as-is (sign
    /// applied the same way as `increase`/`decrease_position_threshold`);
    /// when `None`, the engine interpolates between `decrease` and
    /// `increase` using the configured global cancel ratios instead.
    #[serde(default)]
    pub cancel_increase_position_threshold: Option<Decimal>,
    #[serde(default)]
    pub cancel_decrease_position_threshold: Option<Decimal>,
    #[serde(default = "default_cancel_position_timeout")]
    pub cancel_position_timeout: f64,
}

impl Default for ThresholdData {
    fn default() -> Self {
        Self {
            increase_position_threshold: default_increase(),
            decrease_position_threshold: default_decrease(),
            cancel_increase_position_threshold: None,
            cancel_decrease_position_threshold: None,
            cancel_position_timeout: default_cancel_position_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolData {
    pub symbol_name: String,
    pub makeonly_exchange_name: String,
    #[serde(default)]
    pub long_threshold_data: ThresholdData,
    #[serde(default)]
    pub short_threshold_data: ThresholdData,
    #[serde(default = "default_max_notional_per_order")]
    pub max_notional_per_order: Decimal,
    #[serde(default = "default_max_notional_per_symbol")]
    pub max_notional_per_symbol: Decimal,
    /// Smallest meaningful position/order size in canonical units (§GLOSSARY
    /// `min_amount`). Config-supplied rather than fetched from either
    /// venue's exchange-info endpoint, matching §2.1's "pure lookup table
    /// built at startup" framing for the whole symbol registry.
    #[serde(default = "default_min_amount")]
    pub min_amount: Decimal,
}

fn default_min_amount() -> Decimal {
    dec!(0.001)
}
fn default_contract_size() -> Decimal {
    Decimal::ONE
}
fn default_qty_precision() -> u32 {
    3
}
fn default_multiplier() -> Decimal {
    Decimal::ONE
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InstrumentRef {
    Plain(String),
    Scaled {
        name: String,
        #[serde(default = "default_multiplier")]
        multiplier: Decimal,
        #[serde(default = "default_contract_size")]
        contract_size: Decimal,
        #[serde(default)]
        price_precision: u32,
        #[serde(default = "default_qty_precision")]
        qty_precision: u32,
    },
}

impl InstrumentRef {
    pub fn native_name(&self) -> &str {
        match self {
            InstrumentRef::Plain(n) => n,
            InstrumentRef::Scaled { name, .. } => name,
        }
    }

    pub fn multiplier(&self) -> Decimal {
        match self {
            InstrumentRef::Plain(_) => Decimal::ONE,
            InstrumentRef::Scaled { multiplier, .. } => *multiplier,
        }
    }

    pub fn contract_size(&self) -> Decimal {
        match self {
            InstrumentRef::Plain(_) => default_contract_size(),
            InstrumentRef::Scaled { contract_size, .. } => *contract_size,
        }
    }

    pub fn price_precision(&self) -> u32 {
        match self {
            InstrumentRef::Plain(_) => 0,
            InstrumentRef::Scaled { price_precision, .. } => *price_precision,
        }
    }

    pub fn qty_precision(&self) -> u32 {
        match self {
            InstrumentRef::Plain(_) => default_qty_precision(),
            InstrumentRef::Scaled { qty_precision, .. } => *qty_precision,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolNameData {
    pub venue_a: InstrumentRef,
    pub venue_b: InstrumentRef,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderConfig {
    #[serde(default = "default_env")]
    pub env: String,
    #[serde(default)]
    pub debug: bool,
    /// Operator-set starting mode (§6: `order_mode ∈ {pending, reduce_only,
    /// normal}`). The health monitor layers `maintain` on top of this at
    /// runtime and restores it when a venue recovers.
    #[serde(default = "default_order_mode")]
    pub order_mode: String,
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    pub redis: RedisConfig,
    #[serde(default)]
    pub exchanges: HashMap<String, ExchangeCreds>,
    pub cross_arbitrage_symbol_datas: Vec<SymbolData>,
    pub symbol_name_datas: HashMap<String, SymbolNameData>,

    #[serde(default = "default_increase")]
    pub default_increase_position_threshold: Decimal,
    #[serde(default = "default_decrease")]
    pub default_decrease_position_threshold: Decimal,
    #[serde(default = "default_cancel_increase_ratio")]
    pub default_cancel_increase_position_ratio: Decimal,
    #[serde(default = "default_cancel_decrease_ratio")]
    pub default_cancel_decrease_position_ratio: Decimal,
    #[serde(default = "default_max_used_margin")]
    pub max_used_margin: Decimal,
    #[serde(default = "default_symbol_leverage")]
    pub symbol_leverage: u32,

    /// Short tag embedded in every client order id this process generates
    /// (`cr{tag}mko{ts}`, `cr{tag}mkt{ts}`, `cr{tag}Talg{ts}`), distinguishing
    /// this deployment's orders from any other bot trading the same account.
    #[serde(default = "default_client_tag")]
    pub client_tag: String,

    #[serde(default)]
    pub output_data: OutputDataConfig,
}

fn default_env() -> String {
    "dev".to_string()
}
fn default_order_mode() -> String {
    "normal".to_string()
}
fn default_client_tag() -> String {
    "xva".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputDataConfig {
    #[serde(default = "default_order_loop_csv")]
    pub order_loop: String,
}

fn default_order_loop_csv() -> String {
    "output_data/order_loop.csv".to_string()
}

impl Default for OutputDataConfig {
    fn default() -> Self {
        Self {
            order_loop: default_order_loop_csv(),
        }
    }
}

impl OrderConfig {
    /// Merges `configs/common.json` with `configs/{env}.json`, field-by-field
    /// overriding (the later file's JSON object keys replace the earlier
    /// file's), mirroring `get_config`'s merge-multiple-files behavior.
    pub fn load(config_dir: &Path, env: &str) -> Result<Self, ConfigError> {
        let common_path = config_dir.join("common.json");
        let env_path = config_dir.join(format!("{env}.json"));

        let mut merged = read_json_object(&common_path)?;
        if env_path.exists() {
            let env_value = read_json_object(&env_path)?;
            merge_json(&mut merged, env_value);
        }
        merged
            .as_object_mut()
            .map(|m| m.insert("env".to_string(), serde_json::Value::String(env.to_string())));

        let config: OrderConfig = serde_json::from_value(merged).map_err(|e| ConfigError::Parse {
            path: env_path.to_string_lossy().to_string(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Equivalent of the Python `root_validator`s: applies sign conventions
    /// (long-side thresholds negated, short-side positive) and derives the
    /// `cancel_increase`/`cancel_decrease` lines as linear interpolations
    /// between `increase` and `decrease`, then checks the resulting ordering
    /// invariant from §3.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.configured_order_mode()?;
        if self.cross_arbitrage_symbol_datas.is_empty() {
            return Err(ConfigError::Validation(
                "cross_arbitrage_symbol_datas must not be empty".to_string(),
            ));
        }
        for sd in &self.cross_arbitrage_symbol_datas {
            if !self.symbol_name_datas.contains_key(&sd.symbol_name) {
                return Err(ConfigError::Validation(format!(
                    "symbol_name_datas missing entry for {}",
                    sd.symbol_name
                )));
            }
            if sd.long_threshold_data.increase_position_threshold <= Decimal::ZERO
                || sd.long_threshold_data.decrease_position_threshold <= Decimal::ZERO
            {
                return Err(ConfigError::Validation(format!(
                    "{}: threshold magnitudes must be positive (sign applied at resolve time)",
                    sd.symbol_name
                )));
            }
        }
        Ok(())
    }

    /// Parses the configured starting `order_mode`. `maintain` is not a
    /// valid starting value since it is a health-driven, not operator-set,
    /// mode (§5, §7).
    pub fn configured_order_mode(&self) -> Result<OrderMode, ConfigError> {
        match self.order_mode.as_str() {
            "normal" => Ok(OrderMode::Normal),
            "reduce_only" => Ok(OrderMode::ReduceOnly),
            "pending" => Ok(OrderMode::Pending),
            other => Err(ConfigError::Validation(format!(
                "order_mode must be one of normal, reduce_only, pending (got {other})"
            ))),
        }
    }

    pub fn symbol_data(&self, symbol: &str) -> Option<&SymbolData> {
        self.cross_arbitrage_symbol_datas
            .iter()
            .find(|s| s.symbol_name == symbol)
    }

    /// The non-maker venue name for a symbol given its two-venue pair.
    pub fn taker_name_for(&self, maker_name: &str) -> &'static str {
        if maker_name == "A" {
            "B"
        } else {
            "A"
        }
    }
}

fn read_json_object(path: &Path) -> Result<serde_json::Value, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_string_lossy().to_string(),
        source: e,
    })?;
    serde_json::from_str(&text).map_err(|e| ConfigError::Parse {
        path: path.to_string_lossy().to_string(),
        source: e,
    })
}

/// Shallow-then-recursive object merge: `overlay`'s keys win, nested objects
/// are merged key-by-key, everything else is replaced wholesale.
fn merge_json(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (k, v) in overlay_map {
                match base_map.get_mut(&k) {
                    Some(existing) => merge_json(existing, v),
                    None => {
                        base_map.insert(k, v);
                    }
                }
            }
        }
        (base_slot, overlay_value) => {
            *base_slot = overlay_value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_overlays_nested_keys() {
        let mut base = serde_json::json!({"redis": {"url": "redis://a"}, "debug": false});
        let overlay = serde_json::json!({"redis": {"url": "redis://b"}, "debug": true});
        merge_json(&mut base, overlay);
        assert_eq!(base["redis"]["url"], "redis://b");
        assert_eq!(base["debug"], true);
    }

    #[test]
    fn validate_rejects_empty_symbol_list() {
        let cfg = OrderConfig {
            env: "dev".into(),
            debug: false,
            order_mode: default_order_mode(),
            log: LogConfig::default(),
            network: NetworkConfig::default(),
            redis: RedisConfig {
                url: "redis://localhost".into(),
                orderbook_stream: default_orderbook_stream(),
                orderbook_stream_size: default_orderbook_stream_size(),
            },
            exchanges: HashMap::new(),
            cross_arbitrage_symbol_datas: vec![],
            symbol_name_datas: HashMap::new(),
            default_increase_position_threshold: default_increase(),
            default_decrease_position_threshold: default_decrease(),
            default_cancel_increase_position_ratio: default_cancel_increase_ratio(),
            default_cancel_decrease_position_ratio: default_cancel_decrease_ratio(),
            max_used_margin: default_max_used_margin(),
            symbol_leverage: default_symbol_leverage(),
            client_tag: default_client_tag(),
            output_data: OutputDataConfig::default(),
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn configured_order_mode_rejects_maintain() {
        let mut cfg_json = serde_json::json!({
            "redis": {"url": "redis://localhost"},
            "cross_arbitrage_symbol_datas": [{"symbol_name": "BNB/USDT", "makeonly_exchange_name": "A"}],
            "symbol_name_datas": {"BNB/USDT": {"venue_a": "BNB-USDT-SWAP", "venue_b": "BNBUSDT"}},
            "order_mode": "maintain",
        });
        cfg_json
            .as_object_mut()
            .unwrap()
            .insert("env".to_string(), serde_json::Value::String("dev".to_string()));
        let cfg: OrderConfig = serde_json::from_value(cfg_json).unwrap();
        assert!(cfg.validate().is_err());
    }
}
