//! Threshold Engine (§4.4). Every refresh cycle, for each `(symbol,
//! maker_venue)`: seed from static config, apply a funding-rate adjustment
//! weighted by time-to-next-funding, then publish as one atomic blob. §4.4's
//! optional Step 3 (narrowing a published line only via a rolling spread
//! statistic) is not implemented — nothing in this engine accumulates the
//! per-tick spread samples it would need.
//!
//! Grounded on `cross_arbitrage/order/process_threshold.py` for the seed +
//! funding-adjustment shape, and on `threshold.py`'s `SymbolConfig`/
//! `ThresholdConfig` for the published reader-side shape. The funding
//! adjustment here uses the full piecewise time-to-funding weight table from
//! spec §4.4 rather than `process_threshold.py`'s unweighted `- delta` —
//! that source variant predates the piecewise table and is treated as
//! superseded (see DESIGN.md).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::config::{OrderConfig, SymbolData, ThresholdData};
use crate::context::CancelContext;
use crate::store::Store;
use crate::venue::{FundingSnapshot, VenueKind};

/// Cumulative funding-adjusted threshold shift is clamped to 1% absolute.
/// The source has two variants (0.01 and 0.001, §9 open question); 0.01 is
/// chosen here since it matches the looser of the two and the worked example
/// in §8 (S5) implies a clamp well above the raw per-step magnitudes
/// involved (delta up to 0.0008 at full weight).
const FUNDING_SHIFT_CLAMP: Decimal = dec!(0.01);

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThresholdSide {
    pub increase: Decimal,
    pub decrease: Decimal,
    pub cancel_increase: Decimal,
    pub cancel_decrease: Decimal,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SymbolThresholds {
    pub long: ThresholdSide,
    pub short: ThresholdSide,
}

impl SymbolThresholds {
    /// Invariant (§3, §8 #4): `increase <= cancel_increase <= cancel_decrease
    /// <= decrease` for the long side (all <= 0), mirrored (all >= 0) short.
    pub fn satisfies_ordering(&self) -> bool {
        let l = &self.long;
        l.increase <= l.cancel_increase
            && l.cancel_increase <= l.cancel_decrease
            && l.cancel_decrease <= l.decrease
            && l.decrease <= Decimal::ZERO
            && {
                let s = &self.short;
                s.increase >= s.cancel_increase
                    && s.cancel_increase >= s.cancel_decrease
                    && s.cancel_decrease >= s.decrease
                    && s.decrease >= Decimal::ZERO
            }
    }
}

fn interpolate(from: Decimal, to: Decimal, ratio: Decimal) -> Decimal {
    from + (to - from) * ratio
}

/// Resolves one side's four lines. `increase`/`decrease` are always derived
/// from the configured magnitudes; `cancel_increase`/`cancel_decrease` use
/// the symbol's explicit absolute override when present, falling back to an
/// interpolation between `decrease` and `increase` at the given global ratio
/// otherwise (mirrors `update_symbol_default_values`'s `if ... is None`
/// fallback).
fn side_from_config(
    data: &ThresholdData,
    sign: Decimal,
    cancel_increase_ratio: Decimal,
    cancel_decrease_ratio: Decimal,
) -> ThresholdSide {
    let increase = data.increase_position_threshold * sign;
    let decrease = data.decrease_position_threshold * sign;
    let cancel_increase = match data.cancel_increase_position_threshold {
        Some(v) => v * sign,
        None => interpolate(decrease, increase, cancel_increase_ratio),
    };
    let cancel_decrease = match data.cancel_decrease_position_threshold {
        Some(v) => v * sign,
        None => interpolate(decrease, increase, cancel_decrease_ratio),
    };
    ThresholdSide {
        increase,
        decrease,
        cancel_increase,
        cancel_decrease,
    }
}

/// Step 1: seed from static configured thresholds. Long-side magnitudes are
/// negated, short-side kept positive (§3's signed-threshold convention).
/// `cancel_increase_ratio`/`cancel_decrease_ratio` are the process-wide
/// `default_cancel_increase_position_ratio`/`default_cancel_decrease_position_ratio`
/// config fields, consulted only for sides with no explicit absolute cancel
/// line.
pub fn seed_from_static(
    data: &SymbolData,
    cancel_increase_ratio: Decimal,
    cancel_decrease_ratio: Decimal,
) -> SymbolThresholds {
    SymbolThresholds {
        long: side_from_config(&data.long_threshold_data, -Decimal::ONE, cancel_increase_ratio, cancel_decrease_ratio),
        short: side_from_config(&data.short_threshold_data, Decimal::ONE, cancel_increase_ratio, cancel_decrease_ratio),
    }
}

/// Piecewise time-to-funding weight (§4.4): 0 until T-4h, then 0.25/0.5/0.75/
/// 1.0 stepping at T-4h/3h/2h/1h.
pub fn funding_weight(time_to_funding: chrono::Duration) -> Decimal {
    let hours = time_to_funding.num_seconds() as f64 / 3600.0;
    if hours > 4.0 {
        dec!(0)
    } else if hours > 3.0 {
        dec!(0.25)
    } else if hours > 2.0 {
        dec!(0.5)
    } else if hours > 1.0 {
        dec!(0.75)
    } else {
        dec!(1.0)
    }
}

/// Step 2: funding adjustment. Shifts the long side's `increase` line toward
/// (more negative, tightening the hurdle against funding cost) when
/// `delta > 0`, the short side symmetrically when `delta < 0`, then
/// re-derives that side's cancel lines from the global cancel ratios and
/// clamps. `cancel_increase_ratio`/`cancel_decrease_ratio` are always the
/// process-wide `default_cancel_*_position_ratio` config values — the
/// original re-derives cancel lines the same way regardless of which side
/// shifted, it never reads a per-side ratio.
pub fn apply_funding_adjustment(
    base: &mut SymbolThresholds,
    delta: Decimal,
    weight: Decimal,
    cancel_increase_ratio: Decimal,
    cancel_decrease_ratio: Decimal,
) {
    let shift = delta * weight;
    if delta > Decimal::ZERO {
        let mut increase = base.long.increase - shift;
        increase = increase.clamp(-FUNDING_SHIFT_CLAMP, Decimal::ZERO);
        base.long.increase = increase;
        base.long.cancel_increase = interpolate(base.long.decrease, increase, cancel_increase_ratio);
        base.long.cancel_decrease = interpolate(base.long.decrease, increase, cancel_decrease_ratio);
    } else if delta < Decimal::ZERO {
        let mut increase = base.short.increase - shift;
        increase = increase.clamp(Decimal::ZERO, FUNDING_SHIFT_CLAMP);
        base.short.increase = increase;
        base.short.cancel_increase = interpolate(base.short.decrease, increase, cancel_increase_ratio);
        base.short.cancel_decrease = interpolate(base.short.decrease, increase, cancel_decrease_ratio);
    }
}

pub struct ThresholdEngine {
    pub config: Arc<OrderConfig>,
    pub store: Store,
}

impl ThresholdEngine {
    pub async fn refresh_once(&self) {
        let now_ms = Utc::now().timestamp_millis();
        for symbol_data in &self.config.cross_arbitrage_symbol_datas {
            let maker_venue = if symbol_data.makeonly_exchange_name == "A" {
                VenueKind::A
            } else {
                VenueKind::B
            };
            let taker_venue = maker_venue.other();

            let mut thresholds = seed_from_static(
                symbol_data,
                self.config.default_cancel_increase_position_ratio,
                self.config.default_cancel_decrease_position_ratio,
            );

            let maker_funding = self
                .store
                .get_funding_rate::<FundingSnapshot>(maker_venue.name(), &symbol_data.symbol_name)
                .await
                .unwrap_or(None);
            let taker_funding = self
                .store
                .get_funding_rate::<FundingSnapshot>(taker_venue.name(), &symbol_data.symbol_name)
                .await
                .unwrap_or(None);

            if let (Some(maker), Some(taker)) = (maker_funding, taker_funding) {
                if maker.ts_ms == taker.ts_ms {
                    let delta = maker.rate - taker.rate;
                    let time_to_funding = chrono::Duration::milliseconds(maker.ts_ms - now_ms);
                    let weight = funding_weight(time_to_funding);
                    apply_funding_adjustment(
                        &mut thresholds,
                        delta,
                        weight,
                        self.config.default_cancel_increase_position_ratio,
                        self.config.default_cancel_decrease_position_ratio,
                    );
                }
            }

            debug_assert!(
                thresholds.satisfies_ordering(),
                "threshold ordering invariant violated for {}",
                symbol_data.symbol_name
            );

            if let Err(e) = self
                .store
                .hset_thresholds(maker_venue.name(), &symbol_data.symbol_name, &thresholds)
                .await
            {
                log::warn!("[THRESH] publish failed for {}: {e}", symbol_data.symbol_name);
            }
        }
    }

    pub async fn run(&self, ctx: CancelContext, interval: Duration) {
        loop {
            if ctx.is_canceled() {
                return;
            }
            self.refresh_once().await;
            ctx.sleep(interval, Duration::from_secs(1)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ThresholdData;

    const GLOBAL_CANCEL_INCREASE_RATIO: Decimal = dec!(0.75);
    const GLOBAL_CANCEL_DECREASE_RATIO: Decimal = dec!(0.25);

    fn sample_data() -> SymbolData {
        SymbolData {
            symbol_name: "BNB/USDT".into(),
            makeonly_exchange_name: "A".into(),
            long_threshold_data: ThresholdData {
                increase_position_threshold: dec!(0.0012),
                decrease_position_threshold: dec!(0.0002),
                cancel_increase_position_threshold: None,
                cancel_decrease_position_threshold: None,
                cancel_position_timeout: 120.0,
            },
            short_threshold_data: ThresholdData {
                increase_position_threshold: dec!(0.0012),
                decrease_position_threshold: dec!(0.0002),
                cancel_increase_position_threshold: None,
                cancel_decrease_position_threshold: None,
                cancel_position_timeout: 120.0,
            },
            max_notional_per_order: dec!(20),
            max_notional_per_symbol: dec!(100),
            min_amount: dec!(0.001),
        }
    }

    fn seed(data: &SymbolData) -> SymbolThresholds {
        seed_from_static(data, GLOBAL_CANCEL_INCREASE_RATIO, GLOBAL_CANCEL_DECREASE_RATIO)
    }

    #[test]
    fn seed_satisfies_ordering_invariant() {
        let t = seed(&sample_data());
        assert!(t.satisfies_ordering());
        assert_eq!(t.long.increase, dec!(-0.0012));
        assert_eq!(t.long.decrease, dec!(-0.0002));
    }

    #[test]
    fn seed_uses_explicit_cancel_override_when_present() {
        // spec.md S1: long_increase = -0.0012, cancel_increase = -0.000925 —
        // not derivable from the 0.75/0.25 ratio interpolation (which gives
        // -0.00095), only from an explicit absolute cancel line.
        let mut data = sample_data();
        data.long_threshold_data.cancel_increase_position_threshold = Some(dec!(0.000925));
        let t = seed(&data);
        assert_eq!(t.long.cancel_increase, dec!(-0.000925));
    }

    #[test]
    fn seed_falls_back_to_ratio_interpolation_when_no_override() {
        let t = seed(&sample_data());
        assert_eq!(t.long.cancel_increase, dec!(-0.00095));
        assert_eq!(t.long.cancel_decrease, dec!(-0.00045));
    }

    #[test]
    fn funding_weight_steps_match_spec_table() {
        use chrono::Duration;
        assert_eq!(funding_weight(Duration::hours(5)), dec!(0));
        assert_eq!(funding_weight(Duration::minutes(3 * 60 + 30)), dec!(0.25));
        assert_eq!(funding_weight(Duration::minutes(2 * 60 + 30)), dec!(0.5));
        assert_eq!(funding_weight(Duration::minutes(1 * 60 + 30)), dec!(0.75));
        assert_eq!(funding_weight(Duration::minutes(30)), dec!(1.0));
    }

    #[test]
    fn funding_adjustment_preserves_ordering_invariant() {
        let mut t = seed(&sample_data());
        apply_funding_adjustment(&mut t, dec!(0.0008), dec!(0.75), GLOBAL_CANCEL_INCREASE_RATIO, GLOBAL_CANCEL_DECREASE_RATIO);
        assert!(t.satisfies_ordering());
        // tightened relative to seed: more negative than -0.0012
        assert!(t.long.increase < dec!(-0.0012));
    }

    #[test]
    fn funding_adjustment_clamps_to_one_percent() {
        let mut t = seed(&sample_data());
        apply_funding_adjustment(&mut t, dec!(1.0), dec!(1.0), GLOBAL_CANCEL_INCREASE_RATIO, GLOBAL_CANCEL_DECREASE_RATIO);
        assert_eq!(t.long.increase, -FUNDING_SHIFT_CLAMP);
        assert!(t.satisfies_ordering());
    }

    #[test]
    fn funding_adjustment_uses_same_global_ratio_regardless_of_side() {
        // delta < 0 shifts the short side; the re-derivation must use the
        // same global ratios as the long-side branch, not the long side's
        // configured data.
        let mut data = sample_data();
        data.short_threshold_data.increase_position_threshold = dec!(0.002);
        data.short_threshold_data.decrease_position_threshold = dec!(0.0005);
        let mut t = seed(&data);
        apply_funding_adjustment(&mut t, dec!(-0.0008), dec!(0.75), GLOBAL_CANCEL_INCREASE_RATIO, GLOBAL_CANCEL_DECREASE_RATIO);
        let expected_cancel_increase = interpolate(t.short.decrease, t.short.increase, GLOBAL_CANCEL_INCREASE_RATIO);
        assert_eq!(t.short.cancel_increase, expected_cancel_increase);
        assert!(t.satisfies_ordering());
    }
}
