// =============================================================================
// Trailing / Breakeven Controller
// =============================================================================
//
// R = atr_mult_sl * volatility_unit. For a long (shorts mirror):
//
//   last <  entry + breakeven_after_r * R   -> nothing
//   last <  entry + trail_after_r * R       -> candidate = entry
//   otherwise                               -> candidate = last - trail_atr_mult * vol
//
//   new stop = max(current, candidate, entry)
//
// The stop is replaced only when the new level is strictly tighter than the
// live one, and always place-before-cancel. Resolution is the polling
// interval; this is not tick-level trailing.
// =============================================================================

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::stop_replace::{ratchet_stop, stops_for, tightest_stop, RatchetOutcome};
use crate::error::ExchangeError;
use crate::exchange::Exchange;
use crate::runtime_config::{ProtectionConfig, TrailingConfig};
use crate::symbol_book::SymbolBook;
use crate::types::{find_position, Side};

/// Stop level the trailing rules ask for, or `None` when no move is due.
pub fn trailing_stop(
    side: Side,
    entry: f64,
    last: f64,
    volatility_unit: f64,
    current: Option<f64>,
    cfg: &TrailingConfig,
) -> Option<f64> {
    let r = cfg.atr_mult_sl * volatility_unit;
    if r <= 0.0 || !r.is_finite() || !last.is_finite() {
        return None;
    }
    let sign = side.sign();
    let profit = (last - entry) * sign;
    if profit < cfg.breakeven_after_r * r {
        return None;
    }

    let candidate = if profit < cfg.trail_after_r * r {
        entry
    } else {
        last - sign * cfg.trail_atr_mult * volatility_unit
    };

    let mut level = side.tighter_stop(candidate, entry);
    if let Some(c) = current {
        level = side.tighter_stop(level, c);
    }
    match current {
        Some(c) if !side.stop_improves(level, c) => None,
        _ => Some(level),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrailOutcome {
    Idle,
    Moved { side: Side, trigger: f64 },
    Failed { side: Side, error: ExchangeError },
}

pub struct TrailingController {
    exchange: Arc<dyn Exchange>,
    cfg: TrailingConfig,
    protection: ProtectionConfig,
    hedge: bool,
}

impl TrailingController {
    pub fn new(
        exchange: Arc<dyn Exchange>,
        cfg: TrailingConfig,
        protection: ProtectionConfig,
        hedge: bool,
    ) -> Self {
        Self {
            exchange,
            cfg,
            protection,
            hedge,
        }
    }

    pub async fn run_symbol(&self, book: &SymbolBook, symbol: &str) -> Result<Vec<TrailOutcome>, ExchangeError> {
        if !self.cfg.enabled {
            return Ok(vec![TrailOutcome::Idle]);
        }
        let mut state = book.lock(symbol).await;
        let positions = self.exchange.fetch_positions().await?;
        let orders = self.exchange.fetch_open_orders(symbol).await?;
        let last = self.exchange.last_price(symbol).await?;

        let mut outcomes = Vec::new();
        let sides: Vec<Side> = state.legs.keys().copied().collect();
        for side in sides {
            let leg = state.leg_mut(side);
            let Some(plan) = leg.plan.as_ref() else {
                continue;
            };
            if leg.stage.is_terminal() {
                continue;
            }
            let Some(position) = find_position(&positions, symbol, Some(side)) else {
                continue;
            };

            let stops = stops_for(&orders, side);
            let current = tightest_stop(side, &stops).or(leg.live_stop);
            let Some(target) =
                trailing_stop(side, plan.entry_price, last, plan.volatility_unit, current, &self.cfg)
            else {
                debug!(symbol, %side, last, "trailing: no move");
                outcomes.push(TrailOutcome::Idle);
                continue;
            };

            let known = leg.live_stop;
            let outcome = ratchet_stop(
                self.exchange.as_ref(),
                &self.protection,
                self.hedge,
                position,
                target,
                &orders,
                known,
            )
            .await;
            let leg = state.leg_mut(side);
            match outcome {
                RatchetOutcome::Moved(done) => {
                    info!(symbol, %side, last, stop = done.trigger, "trailing stop ratcheted");
                    leg.live_stop = Some(done.trigger);
                    outcomes.push(TrailOutcome::Moved { side, trigger: done.trigger });
                }
                RatchetOutcome::NotTighter { .. } => outcomes.push(TrailOutcome::Idle),
                RatchetOutcome::Failed(error) => {
                    warn!(symbol, %side, target, error = %error, "trailing stop replace failed; old stop kept");
                    outcomes.push(TrailOutcome::Failed { side, error });
                }
            }
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> TrailingConfig {
        // R = 2.5 * 1.0 = 2.5
        TrailingConfig {
            atr_mult_sl: 2.5,
            breakeven_after_r: 1.0,
            trail_after_r: 1.5,
            trail_atr_mult: 1.0,
            enabled: true,
        }
    }

    #[test]
    fn below_breakeven_trigger_does_nothing() {
        assert_eq!(trailing_stop(Side::Long, 100.0, 102.0, 1.0, Some(98.0), &cfg()), None);
        assert_eq!(trailing_stop(Side::Short, 100.0, 98.0, 1.0, Some(102.0), &cfg()), None);
    }

    #[test]
    fn breakeven_zone_moves_to_entry() {
        assert_eq!(trailing_stop(Side::Long, 100.0, 103.0, 1.0, Some(98.0), &cfg()), Some(100.0));
        assert_eq!(trailing_stop(Side::Short, 100.0, 97.0, 1.0, Some(102.0), &cfg()), Some(100.0));
    }

    #[test]
    fn trail_zone_follows_price() {
        // 1.5 R = 3.75 -> trail from 103.75 upward at 1 vol below last.
        assert_eq!(trailing_stop(Side::Long, 100.0, 105.0, 1.0, Some(100.0), &cfg()), Some(104.0));
        assert_eq!(trailing_stop(Side::Short, 100.0, 95.0, 1.0, Some(100.0), &cfg()), Some(96.0));
    }

    #[test]
    fn never_loosens() {
        // Current stop already above what trailing asks for.
        assert_eq!(trailing_stop(Side::Long, 100.0, 105.0, 1.0, Some(104.5), &cfg()), None);
        // Equal is not an improvement.
        assert_eq!(trailing_stop(Side::Long, 100.0, 105.0, 1.0, Some(104.0), &cfg()), None);
        assert_eq!(trailing_stop(Side::Short, 100.0, 95.0, 1.0, Some(95.5), &cfg()), None);
    }

    #[test]
    fn stop_is_never_below_entry_once_armed() {
        // Huge trail distance would put the candidate below entry.
        let mut c = cfg();
        c.trail_atr_mult = 10.0;
        assert_eq!(trailing_stop(Side::Long, 100.0, 105.0, 1.0, Some(98.0), &c), Some(100.0));
    }

    #[test]
    fn zero_volatility_disables() {
        assert_eq!(trailing_stop(Side::Long, 100.0, 150.0, 0.0, Some(98.0), &cfg()), None);
    }

    #[tokio::test]
    async fn controller_ratchets_live_stop_and_skips_terminal() {
        use crate::exchange::{PaperExchange, SymbolRules};
        use crate::protection::placement::OrderPlacer;
        use crate::protection::plan::ExitPlan;
        use crate::symbol_book::{ExitStage, LegState};
        use crate::types::Decision;
        use chrono::Utc;

        let ex = Arc::new(PaperExchange::new(10_000.0));
        ex.set_price("ETHUSDT", 100.0);
        let d = Decision {
            symbol: "ETHUSDT".into(),
            side: Side::Long,
            entry_price: 100.0,
            initial_stop: 97.5,
            volatility_unit: 1.0,
            targets: vec![110.0],
            splits: vec![1.0],
        };
        let plan = ExitPlan::new(&d, 1.0, &SymbolRules::default()).unwrap();
        let prot = ProtectionConfig::default();
        let report = OrderPlacer::new(ex.clone(), prot.clone(), false)
            .place(&plan, &SymbolRules::default())
            .await
            .unwrap();
        let book = SymbolBook::new();
        book.lock("ETHUSDT")
            .await
            .legs
            .insert(Side::Long, LegState::for_entry(plan, report.stop_trigger, Utc::now()));

        let ctl = TrailingController::new(ex.clone(), cfg(), prot, false);

        ex.set_price("ETHUSDT", 105.0);
        let out = ctl.run_symbol(&book, "ETHUSDT").await.unwrap();
        assert_eq!(out, vec![TrailOutcome::Moved { side: Side::Long, trigger: 104.0 }]);

        // Price pulls back: stop stays.
        ex.set_price("ETHUSDT", 104.5);
        let out = ctl.run_symbol(&book, "ETHUSDT").await.unwrap();
        assert_eq!(out, vec![TrailOutcome::Idle]);
        let stops: Vec<_> = ex.orders("ETHUSDT").into_iter().filter(|o| o.is_stop_loss()).collect();
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].trigger_price, Some(104.0));

        book.lock("ETHUSDT").await.leg_mut(Side::Long).stage = ExitStage::TERMINAL;
        ex.set_price("ETHUSDT", 108.0);
        assert!(ctl.run_symbol(&book, "ETHUSDT").await.unwrap().is_empty());
    }
}
