//! Uniform contract over the two venue families (§4.1). `VenueKind` tags which
//! branch a caller is on for the handful of places that need per-venue
//! behavior (qty alignment, balance-field parsing) per the §9 design note
//! ("switch/dispatch on a `VenueKind` tag").

pub mod rest;
pub mod signing;
pub mod venue_a;
pub mod venue_b;

pub use rest::RestVenueAdapter;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::VenueError;
use crate::symbol::Symbol;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VenueKind {
    A,
    B,
}

impl VenueKind {
    pub fn name(&self) -> &'static str {
        match self {
            VenueKind::A => "A",
            VenueKind::B => "B",
        }
    }

    pub fn other(&self) -> VenueKind {
        match self {
            VenueKind::A => VenueKind::B,
            VenueKind::B => VenueKind::A,
        }
    }
}

impl std::fmt::Display for VenueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(&self) -> OrderSide {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Limit,
    Market,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }

    pub fn is_canceled_or_filled(&self) -> bool {
        matches!(self, OrderStatus::Canceled | OrderStatus::Filled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionDirection {
    Long,
    Short,
}

impl PositionDirection {
    /// Signed quantity convention used by the aligner: long is positive.
    pub fn sign(&self) -> Decimal {
        match self {
            PositionDirection::Long => Decimal::ONE,
            PositionDirection::Short => -Decimal::ONE,
        }
    }
}

/// `{venue, id, client_id, ts, last_trade_ts, symbol, type, side, status,
/// price, avg_price?, amount, filled, cost}` (§3 OrderRecord).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRecord {
    pub venue: VenueKind,
    pub id: String,
    pub client_id: String,
    pub ts_ms: i64,
    pub last_trade_ts_ms: Option<i64>,
    pub symbol: String,
    pub order_type: OrderType,
    pub side: OrderSide,
    pub status: OrderStatus,
    pub price: Decimal,
    pub avg_price: Option<Decimal>,
    pub amount: Decimal,
    pub filled: Decimal,
    pub cost: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionStatus {
    pub direction: PositionDirection,
    pub qty: Decimal,
    pub avg_price: Option<Decimal>,
    pub mark_price: Option<Decimal>,
}

impl PositionStatus {
    /// Signed qty, long positive, short negative; zero positions have no
    /// canonical direction so callers should special-case `qty == 0`.
    pub fn signed_qty(&self) -> Decimal {
        self.qty * self.direction.sign()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub used: Decimal,
    pub free: Decimal,
    pub total: Decimal,
}

impl Balance {
    pub fn used_ratio(&self) -> Decimal {
        if self.total.is_zero() {
            Decimal::ONE
        } else {
            self.used / self.total
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingSnapshot {
    pub venue: VenueKind,
    pub symbol: String,
    pub rate: Decimal,
    pub ts_ms: i64,
    pub delta: Option<Decimal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeHealth {
    Ok,
    Maintenance,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeStatus {
    pub ok: bool,
    pub status: ExchangeHealth,
    pub msg: Option<String>,
}

/// `align_qty(symbol, qty) -> (aligned, remainder)` per §4.1: venue-A
/// quantizes to whole contracts (`bag_size`); venue-B rounds down to its
/// fractional precision. Shared here since the math, not the wire format, is
/// what differs between the two families.
pub fn align_qty(kind: VenueKind, symbol: &Symbol, qty: Decimal) -> (Decimal, Decimal) {
    let instrument = symbol.instrument(kind);
    match kind {
        VenueKind::A => {
            let bag = instrument.bag_size();
            if bag.is_zero() {
                return (Decimal::ZERO, qty);
            }
            let contracts = (qty / bag).trunc();
            let aligned = contracts * bag;
            (aligned, qty - aligned)
        }
        VenueKind::B => {
            let scale = Decimal::from(10u64.pow(instrument.qty_precision)) ;
            let base_qty = qty / instrument.multiplier;
            let truncated = (base_qty * scale).trunc() / scale;
            let aligned = truncated * instrument.multiplier;
            (aligned, qty - aligned)
        }
    }
}

#[async_trait]
pub trait VenueAdapter: Send + Sync {
    fn kind(&self) -> VenueKind;

    async fn get_balance(&self) -> Result<Balance, VenueError>;
    async fn get_positions(&self) -> Result<Vec<(String, PositionStatus)>, VenueError>;
    async fn fetch_open_orders(&self, symbol: &str) -> Result<Vec<OrderRecord>, VenueError>;
    async fn fetch_order(&self, symbol: &str, order_id: &str) -> Result<OrderRecord, VenueError>;
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), VenueError>;
    async fn cancel_all_orders(&self, symbol: &str) -> Result<(), VenueError>;
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<(), VenueError>;
    async fn set_margin_mode_cross(&self, symbol: &str) -> Result<(), VenueError>;
    async fn disable_hedge_mode(&self) -> Result<(), VenueError>;
    async fn get_funding_rate(&self, symbol: &str) -> Result<FundingSnapshot, VenueError>;
    async fn check_status(&self) -> Result<ExchangeStatus, VenueError>;

    async fn place_limit_post_only(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        price: Decimal,
        client_id: &str,
    ) -> Result<OrderRecord, VenueError>;

    async fn place_market(
        &self,
        symbol: &str,
        side: OrderSide,
        qty: Decimal,
        reduce_only: bool,
        client_id: &str,
    ) -> Result<OrderRecord, VenueError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::VenueInstrument;
    use rust_decimal_macros::dec;

    fn symbol() -> Symbol {
        Symbol {
            canonical: "BNB/USDT".into(),
            venue_a: VenueInstrument {
                native_name: "BNB-USDT-SWAP".into(),
                multiplier: dec!(1),
                contract_size: dec!(0.1),
                price_precision: 2,
                qty_precision: 0,
            },
            venue_b: VenueInstrument {
                native_name: "BNBUSDT".into(),
                multiplier: dec!(1),
                contract_size: dec!(1),
                price_precision: 2,
                qty_precision: 3,
            },
            min_amount: dec!(0.1),
        }
    }

    #[test]
    fn align_qty_is_idempotent() {
        let sym = symbol();
        let (aligned_once, _) = align_qty(VenueKind::A, &sym, dec!(5.37));
        let (aligned_twice, _) = align_qty(VenueKind::A, &sym, aligned_once);
        assert_eq!(aligned_once, aligned_twice);

        let (aligned_once_b, _) = align_qty(VenueKind::B, &sym, dec!(5.3789));
        let (aligned_twice_b, _) = align_qty(VenueKind::B, &sym, aligned_once_b);
        assert_eq!(aligned_once_b, aligned_twice_b);
    }

    #[test]
    fn align_qty_venue_a_quantizes_to_bag_size() {
        let sym = symbol();
        let (aligned, remainder) = align_qty(VenueKind::A, &sym, dec!(5.37));
        assert_eq!(aligned, dec!(5.3));
        assert_eq!(remainder, dec!(0.07));
    }

    #[test]
    fn align_qty_venue_b_rounds_down_to_precision() {
        let sym = symbol();
        let (aligned, _) = align_qty(VenueKind::B, &sym, dec!(5.3789));
        assert_eq!(aligned, dec!(5.378));
    }
}
