// =============================================================================
// Exit Plan — staged targets and the stop each stage ratchets to
// =============================================================================
//
// Built once at entry time from a strategy `Decision` and the sized entry
// quantity, then read-only. Take-profit leg quantities are floored to the
// exchange step with the final leg absorbing the remainder, so the legs
// always sum to the entry quantity.
//
// Stop per stage:
//   0          initial stop
//   1          entry price (breakeven)
//   2          first target price
//   terminal   none (position closes on the last take-profit)
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::exchange::SymbolRules;
use crate::symbol_book::ExitStage;
use crate::types::{Decision, Side};

pub const MAX_TARGETS: usize = 3;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("decision has no targets")]
    NoTargets,
    #[error("decision has {0} targets, at most {MAX_TARGETS} supported")]
    TooManyTargets(usize),
    #[error("{targets} targets but {splits} splits")]
    SplitMismatch { targets: usize, splits: usize },
    #[error("splits must be positive and sum to at most 1.0 (sum {0})")]
    InvalidSplits(f64),
    #[error("prices must be finite and positive")]
    InvalidPrice,
    #[error("initial stop {stop} is not on the loss side of entry {entry}")]
    StopOnWrongSide { entry: f64, stop: f64 },
    #[error("target {index} ({price}) is not beyond the previous level")]
    TargetOutOfOrder { index: usize, price: f64 },
    #[error("quantity {0} leaves no take-profit leg above the exchange minimum")]
    QuantityTooSmall(f64),
}

/// Validate a strategy decision before any sizing happens.
pub fn validate_decision(d: &Decision) -> Result<(), PlanError> {
    if d.targets.is_empty() {
        return Err(PlanError::NoTargets);
    }
    if d.targets.len() > MAX_TARGETS {
        return Err(PlanError::TooManyTargets(d.targets.len()));
    }
    if d.splits.len() != d.targets.len() {
        return Err(PlanError::SplitMismatch {
            targets: d.targets.len(),
            splits: d.splits.len(),
        });
    }
    let sum: f64 = d.splits.iter().sum();
    if d.splits.iter().any(|s| !s.is_finite() || *s <= 0.0) || sum > 1.0 + 1e-9 {
        return Err(PlanError::InvalidSplits(sum));
    }
    let prices = [d.entry_price, d.initial_stop]
        .into_iter()
        .chain(d.targets.iter().copied());
    if prices.into_iter().any(|p| !p.is_finite() || p <= 0.0) {
        return Err(PlanError::InvalidPrice);
    }

    let sign = d.side.sign();
    if (d.entry_price - d.initial_stop) * sign <= 0.0 {
        return Err(PlanError::StopOnWrongSide {
            entry: d.entry_price,
            stop: d.initial_stop,
        });
    }
    let mut previous = d.entry_price;
    for (index, &price) in d.targets.iter().enumerate() {
        if (price - previous) * sign <= 0.0 {
            return Err(PlanError::TargetOutOfOrder { index, price });
        }
        previous = price;
    }
    Ok(())
}

/// One take-profit leg.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TakeProfitLeg {
    pub price: f64,
    pub quantity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitPlan {
    pub symbol: String,
    pub side: Side,
    pub entry_price: f64,
    pub initial_stop: f64,
    pub volatility_unit: f64,
    pub quantity: f64,
    /// Nearest target first.
    pub legs: Vec<TakeProfitLeg>,
    pub created_at: DateTime<Utc>,
}

impl ExitPlan {
    /// Build the plan for an entry of `quantity`. Legs that round below the
    /// exchange minimum are folded into the final leg.
    pub fn new(d: &Decision, quantity: f64, rules: &SymbolRules) -> Result<Self, PlanError> {
        validate_decision(d)?;

        let total_steps = rules.quantity_steps(quantity);
        if total_steps == 0 {
            return Err(PlanError::QuantityTooSmall(quantity));
        }

        let mut legs: Vec<TakeProfitLeg> = Vec::with_capacity(d.targets.len());
        let mut used = 0u64;
        let last = d.targets.len() - 1;
        for (i, (&price, &split)) in d.targets.iter().zip(d.splits.iter()).enumerate() {
            let steps = if i == last {
                total_steps - used
            } else {
                let wanted = (total_steps as f64 * split + 1e-9).floor() as u64;
                wanted.min(total_steps - used)
            };
            let qty = rules.quantity_from_steps(steps);
            if i != last && (steps == 0 || qty + 1e-12 < rules.min_qty) {
                continue;
            }
            used += steps;
            legs.push(TakeProfitLeg { price, quantity: qty });
        }

        // Final leg may itself be dust after the others took their share.
        while let Some(tail) = legs.last().copied() {
            if tail.quantity + 1e-12 >= rules.min_qty && tail.quantity > 0.0 {
                break;
            }
            legs.pop();
            match legs.last_mut() {
                Some(prev) => {
                    let merged = rules.quantity_steps(prev.quantity) + rules.quantity_steps(tail.quantity);
                    prev.quantity = rules.quantity_from_steps(merged);
                }
                None => return Err(PlanError::QuantityTooSmall(quantity)),
            }
        }

        Ok(Self {
            symbol: d.symbol.clone(),
            side: d.side,
            entry_price: d.entry_price,
            initial_stop: d.initial_stop,
            volatility_unit: d.volatility_unit,
            quantity: rules.quantity_from_steps(total_steps),
            legs,
            created_at: Utc::now(),
        })
    }

    pub fn total_legs(&self) -> usize {
        self.legs.len()
    }

    /// Stop the position should carry once `stage` legs have filled.
    pub fn stop_for_stage(&self, stage: ExitStage) -> Option<f64> {
        if stage.is_terminal() {
            return None;
        }
        match stage.value() {
            0 => Some(self.initial_stop),
            1 => Some(self.entry_price),
            _ => self.legs.first().map(|l| l.price),
        }
    }

    /// Whether an exchange position entered at `entry_price` can be the one
    /// this plan was built for. Fill slippage beyond the whole stop distance
    /// means the position came from somewhere else.
    pub fn matches_position(&self, entry_price: f64) -> bool {
        (entry_price - self.entry_price).abs() <= (self.entry_price - self.initial_stop).abs()
    }

    /// Legs still expected to be resting at `stage`.
    pub fn remaining_legs(&self, stage: ExitStage) -> &[TakeProfitLeg] {
        if stage.is_terminal() {
            return &[];
        }
        let from = (stage.value() as usize).min(self.legs.len());
        &self.legs[from..]
    }
}
