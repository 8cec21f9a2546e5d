// =============================================================================
// Risk Sizer — entry quantity from equity, stop distance and notional caps
// =============================================================================
//
// Two independent limits, the smaller wins:
//   1. Risk      — lose at most `risk_amount` if the initial stop is hit.
//   2. Notional  — never commit more than a fraction of leveraged equity,
//                  with an extra margin haircut.
//
// The result is floored to the exchange quantity step. A zero result means
// "do not trade" and the caller must skip the entry.
// =============================================================================

use serde::{Deserialize, Serialize};

use crate::runtime_config::SizingConfig;

/// Sizing inputs for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SizingParams {
    pub equity: f64,
    pub risk_per_trade: f64,
    /// Fixed USDT risk; replaces `risk_per_trade` when > 0.
    pub abs_risk: f64,
    pub risk_floor: f64,
    pub leverage: u32,
    pub max_notional_fraction: f64,
    pub margin_buffer_frac: f64,
}

impl SizingParams {
    pub fn from_config(cfg: &SizingConfig, equity: f64) -> Self {
        Self {
            equity,
            risk_per_trade: cfg.risk_per_trade,
            abs_risk: cfg.abs_risk,
            risk_floor: cfg.risk_floor,
            leverage: cfg.leverage,
            max_notional_fraction: cfg.max_notional_fraction,
            margin_buffer_frac: cfg.margin_buffer_frac,
        }
    }

    /// USDT amount at risk between entry and stop.
    pub fn risk_amount(&self) -> f64 {
        let base = if self.abs_risk > 0.0 {
            self.abs_risk
        } else {
            self.equity * self.risk_per_trade
        };
        base.max(self.risk_floor)
    }

    /// Largest notional the account may hold for one entry.
    pub fn notional_cap(&self) -> f64 {
        self.equity * self.leverage as f64 * self.max_notional_fraction * self.margin_buffer_frac
    }
}

/// Quantity to open, floored to `qty_step`. Zero when the trade must be
/// skipped.
pub fn position_size(entry: f64, stop: f64, params: &SizingParams, qty_step: f64) -> f64 {
    let distance = (entry - stop).abs();
    if entry <= 0.0 || distance <= 0.0 || !distance.is_finite() {
        return 0.0;
    }

    let by_risk = params.risk_amount() / distance;
    let by_notional = params.notional_cap() / entry;
    let raw = by_risk.min(by_notional).max(0.0);

    if qty_step > 0.0 {
        // Snap float noise before flooring (1.5 / 0.001 = 1499.9999...).
        let steps = raw / qty_step;
        let steps = if (steps - steps.round()).abs() < 1e-9 {
            steps.round()
        } else {
            steps.floor()
        };
        steps * qty_step
    } else {
        raw
    }
}
