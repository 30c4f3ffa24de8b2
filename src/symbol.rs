use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::{InstrumentRef, OrderConfig};
use crate::venue::VenueKind;

/// Per-venue instrument mapping: the venue's native identifier plus the
/// scaling factor applied when the venue quotes a non-1:1 unit (e.g.
/// "1000PEPEUSDT"). `contract_size` is the venue's native per-contract size;
/// `bag_size = contract_size * multiplier` is the canonical-unit size of one
/// native contract (§GLOSSARY).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueInstrument {
    pub native_name: String,
    pub multiplier: Decimal,
    pub contract_size: Decimal,
    pub price_precision: u32,
    pub qty_precision: u32,
}

impl VenueInstrument {
    pub fn bag_size(&self) -> Decimal {
        self.contract_size * self.multiplier
    }
}

/// One entry of the symbol registry: a canonical symbol (e.g. `BNB/USDT`)
/// resolved to both venues' native instruments. Pure, immutable lookup data
/// built once at startup (§2.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Symbol {
    pub canonical: String,
    pub venue_a: VenueInstrument,
    pub venue_b: VenueInstrument,
    /// Smallest meaningful position/order size in canonical units, used for
    /// the various `qty >= min` comparisons scattered through the spec.
    pub min_amount: Decimal,
}

impl Symbol {
    pub fn instrument(&self, venue: VenueKind) -> &VenueInstrument {
        match venue {
            VenueKind::A => &self.venue_a,
            VenueKind::B => &self.venue_b,
        }
    }
}

/// Built once at startup from `symbol_name_datas` in config; never mutated
/// afterward, so lookups need no locking.
#[derive(Debug, Clone, Default)]
pub struct SymbolRegistry {
    by_canonical: HashMap<String, Symbol>,
}

impl SymbolRegistry {
    pub fn new(symbols: Vec<Symbol>) -> Self {
        let by_canonical = symbols
            .into_iter()
            .map(|s| (s.canonical.clone(), s))
            .collect();
        Self { by_canonical }
    }

    /// Builds the registry from `cross_arbitrage_symbol_datas` +
    /// `symbol_name_datas` (§2.1: "pure lookup table built at startup").
    pub fn from_config(config: &OrderConfig) -> anyhow::Result<Self> {
        let mut symbols = Vec::with_capacity(config.cross_arbitrage_symbol_datas.len());
        for sd in &config.cross_arbitrage_symbol_datas {
            let name_data = config.symbol_name_datas.get(&sd.symbol_name).ok_or_else(|| {
                anyhow::anyhow!("symbol_name_datas missing entry for {}", sd.symbol_name)
            })?;
            symbols.push(Symbol {
                canonical: sd.symbol_name.clone(),
                venue_a: instrument_from_ref(&name_data.venue_a),
                venue_b: instrument_from_ref(&name_data.venue_b),
                min_amount: sd.min_amount,
            });
        }
        Ok(Self::new(symbols))
    }

    pub fn get(&self, canonical: &str) -> Option<&Symbol> {
        self.by_canonical.get(canonical)
    }

    pub fn all(&self) -> impl Iterator<Item = &Symbol> {
        self.by_canonical.values()
    }

    /// Fatal for the missing symbol (logged), not for the process (§7).
    pub fn require(&self, canonical: &str) -> anyhow::Result<&Symbol> {
        self.get(canonical)
            .ok_or_else(|| anyhow::anyhow!("symbol mapping miss: {canonical}"))
    }
}

fn instrument_from_ref(r: &InstrumentRef) -> VenueInstrument {
    VenueInstrument {
        native_name: r.native_name().to_string(),
        multiplier: r.multiplier(),
        contract_size: r.contract_size(),
        price_precision: r.price_precision(),
        qty_precision: r.qty_precision(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExchangeCreds, LogConfig, NetworkConfig, OutputDataConfig, RedisConfig, SymbolNameData, ThresholdData};
    use rust_decimal_macros::dec;

    fn sample() -> Symbol {
        Symbol {
            canonical: "BNB/USDT".to_string(),
            venue_a: VenueInstrument {
                native_name: "BNB-USDT-SWAP".to_string(),
                multiplier: dec!(1),
                contract_size: dec!(1),
                price_precision: 2,
                qty_precision: 0,
            },
            venue_b: VenueInstrument {
                native_name: "BNBUSDT".to_string(),
                multiplier: dec!(1),
                contract_size: dec!(1),
                price_precision: 2,
                qty_precision: 3,
            },
            min_amount: dec!(0.1),
        }
    }

    #[test]
    fn bag_size_is_contract_size_times_multiplier() {
        let sym = sample();
        assert_eq!(sym.venue_a.bag_size(), dec!(1));
    }

    #[test]
    fn registry_lookup_roundtrips() {
        let reg = SymbolRegistry::new(vec![sample()]);
        assert!(reg.get("BNB/USDT").is_some());
        assert!(reg.get("ETH/USDT").is_none());
        assert!(reg.require("ETH/USDT").is_err());
    }

    #[test]
    fn from_config_resolves_symbols_from_symbol_name_datas() {
        let mut symbol_name_datas = HashMap::new();
        symbol_name_datas.insert(
            "BNB/USDT".to_string(),
            SymbolNameData {
                venue_a: InstrumentRef::Plain("BNB-USDT-SWAP".to_string()),
                venue_b: InstrumentRef::Scaled {
                    name: "1000BNBUSDT".to_string(),
                    multiplier: dec!(1000),
                    contract_size: dec!(1),
                    price_precision: 2,
                    qty_precision: 3,
                },
            },
        );
        let config = crate::config::OrderConfig {
            env: "dev".into(),
            debug: false,
            order_mode: "normal".into(),
            log: LogConfig::default(),
            network: NetworkConfig::default(),
            redis: RedisConfig {
                url: "redis://localhost".into(),
                orderbook_stream: "orderbook_stream".into(),
                orderbook_stream_size: 100,
            },
            exchanges: HashMap::<String, ExchangeCreds>::new(),
            cross_arbitrage_symbol_datas: vec![crate::config::SymbolData {
                symbol_name: "BNB/USDT".into(),
                makeonly_exchange_name: "A".into(),
                long_threshold_data: ThresholdData::default(),
                short_threshold_data: ThresholdData::default(),
                max_notional_per_order: dec!(20),
                max_notional_per_symbol: dec!(100),
                min_amount: dec!(0.01),
            }],
            symbol_name_datas,
            default_increase_position_threshold: dec!(0.0012),
            default_decrease_position_threshold: dec!(0.0002),
            default_cancel_increase_position_ratio: dec!(0.75),
            default_cancel_decrease_position_ratio: dec!(0.25),
            max_used_margin: dec!(0.9),
            symbol_leverage: 2,
            client_tag: "xva".into(),
            output_data: OutputDataConfig::default(),
        };

        let registry = SymbolRegistry::from_config(&config).unwrap();
        let sym = registry.get("BNB/USDT").unwrap();
        assert_eq!(sym.venue_a.native_name, "BNB-USDT-SWAP");
        assert_eq!(sym.venue_b.native_name, "1000BNBUSDT");
        assert_eq!(sym.venue_b.multiplier, dec!(1000));
        assert_eq!(sym.min_amount, dec!(0.01));
    }
}
