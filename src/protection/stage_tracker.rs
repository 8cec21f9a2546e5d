// =============================================================================
// Exit-Stage Tracker — infer take-profit fills by diffing open orders
// =============================================================================
//
// The exchange offers no fill stream we rely on, so fills are inferred: each
// pass counts the take-profit orders resting for a position side and compares
// with the previous count. The first sample after an entry only records a
// baseline. A drop of k advances the stage by k (capped at the plan's legs):
//
//   stage 1   stop -> entry (breakeven)
//   stage 2   stop -> first target price
//   terminal  remaining stop canceled once the position is gone
//
// A new stop is applied only when it strictly improves the live one, using
// place-before-cancel. Everything runs under the symbol lock on a fresh
// snapshot, so a pass can be repeated safely after a crash or restart.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use super::stop_replace::{ratchet_stop, stops_for, RatchetOutcome};
use crate::error::ExchangeError;
use crate::exchange::Exchange;
use crate::runtime_config::ProtectionConfig;
use crate::symbol_book::{ExitStage, ProtectionStatus, SymbolBook, SymbolState};
use crate::types::{find_position, ExchangePosition, OpenOrder, Side};

/// What a tracker pass did for one position side.
#[derive(Debug, Clone, PartialEq)]
pub enum StageEvent {
    Baseline { side: Side, take_profits: usize },
    Advanced { side: Side, from: ExitStage, to: ExitStage, fills: usize },
    StopMoved { side: Side, trigger: f64 },
    StopUnchanged { side: Side, target: f64, current: f64 },
    StopMoveFailed { side: Side, error: ExchangeError },
    StopsCanceled { side: Side, order_ids: Vec<String> },
    PositionClosed { side: Side },
    /// The position on the exchange is not the one the plan was built for.
    PlanReleased { side: Side },
}

/// Take-profit orders resting for `side`.
pub fn take_profit_count(orders: &[OpenOrder], side: Side) -> usize {
    orders
        .iter()
        .filter(|o| o.is_take_profit() && o.target_side() == side)
        .count()
}

pub struct StageTracker {
    exchange: Arc<dyn Exchange>,
    cfg: ProtectionConfig,
    hedge: bool,
}

impl StageTracker {
    pub fn new(exchange: Arc<dyn Exchange>, cfg: ProtectionConfig, hedge: bool) -> Self {
        Self { exchange, cfg, hedge }
    }

    /// One locked pass over `symbol`: fresh snapshot, diff, act, publish.
    pub async fn run_symbol(&self, book: &SymbolBook, symbol: &str) -> Result<Vec<StageEvent>, ExchangeError> {
        let mut state = book.lock(symbol).await;
        let positions = self.exchange.fetch_positions().await?;
        let orders = self.exchange.fetch_open_orders(symbol).await?;

        let events = self.sync(symbol, &mut state, &orders, &positions).await;

        for (side, leg) in &state.legs {
            let size = find_position(&positions, symbol, Some(*side)).map_or(0.0, |p| p.size);
            book.publish(ProtectionStatus::from_leg(
                symbol,
                *side,
                leg,
                take_profit_count(&orders, *side),
                size,
            ));
        }
        Ok(events)
    }

    /// Diff `orders` against the stored state and apply stage transitions.
    /// The caller must hold the symbol lock that owns `state`.
    pub async fn sync(
        &self,
        symbol: &str,
        state: &mut SymbolState,
        orders: &[OpenOrder],
        positions: &[ExchangePosition],
    ) -> Vec<StageEvent> {
        let now = Utc::now();
        let mut events = Vec::new();
        let sides: Vec<Side> = state.legs.keys().copied().collect();

        for side in sides {
            let leg = state.leg_mut(side);
            let Some(plan) = leg.plan.clone() else {
                continue;
            };
            let position = find_position(positions, symbol, Some(side));
            let tp_count = take_profit_count(orders, side);

            if let Some(p) = position {
                if !plan.matches_position(p.entry_price) {
                    warn!(symbol, %side, entry = p.entry_price, planned = plan.entry_price, "position does not match its exit plan; dropping the plan");
                    leg.release();
                    events.push(StageEvent::PlanReleased { side });
                    continue;
                }
            }

            if leg.stage.is_terminal() {
                if position.is_none() && self.cancel_stops(symbol, side, orders, &mut events).await {
                    leg.release();
                }
                continue;
            }

            let Some(position) = position else {
                // Fresh entries may not be visible yet.
                if leg.placed_within(now, self.cfg.position_visible_timeout_secs) {
                    debug!(symbol, %side, "position not visible yet; skipping");
                    continue;
                }
                info!(symbol, %side, from = %leg.stage, "position closed; stage terminal");
                leg.stage = ExitStage::TERMINAL;
                leg.last_tp_count = Some(tp_count);
                events.push(StageEvent::PositionClosed { side });
                if self.cancel_stops(symbol, side, orders, &mut events).await {
                    leg.release();
                }
                continue;
            };

            let Some(previous) = leg.last_tp_count else {
                debug!(symbol, %side, take_profits = tp_count, "take-profit baseline recorded");
                leg.last_tp_count = Some(tp_count);
                events.push(StageEvent::Baseline { side, take_profits: tp_count });
                continue;
            };
            leg.last_tp_count = Some(tp_count);
            if tp_count >= previous {
                continue;
            }

            let fills = previous - tp_count;
            let from = leg.stage;
            let to = from.advanced(fills, plan.total_legs());
            leg.stage = to;
            info!(symbol, %side, %from, %to, fills, "exit stage advanced");
            events.push(StageEvent::Advanced { side, from, to, fills });

            let Some(desired) = plan.stop_for_stage(to) else {
                // Every leg is gone but the position is still open; keep the
                // stop until the position itself disappears.
                warn!(symbol, %side, size = position.size, "all take-profits gone with position still open; stop kept");
                continue;
            };

            let known = leg.live_stop;
            let outcome = ratchet_stop(
                self.exchange.as_ref(),
                &self.cfg,
                self.hedge,
                position,
                desired,
                orders,
                known,
            )
            .await;
            let leg = state.leg_mut(side);
            match outcome {
                RatchetOutcome::Moved(done) => {
                    info!(symbol, %side, stage = %to, stop = done.trigger, "stop relocated for stage");
                    leg.live_stop = Some(done.trigger);
                    events.push(StageEvent::StopMoved { side, trigger: done.trigger });
                }
                RatchetOutcome::NotTighter { target, current } => {
                    leg.live_stop.get_or_insert(current);
                    events.push(StageEvent::StopUnchanged { side, target, current });
                }
                RatchetOutcome::Failed(error) => {
                    warn!(symbol, %side, stage = %to, error = %error, "stage stop relocation failed; reconciler will retry");
                    events.push(StageEvent::StopMoveFailed { side, error });
                }
            }
        }
        events
    }

    /// Cancel every stop resting for `side`. Returns false if any is still
    /// there afterwards.
    async fn cancel_stops(
        &self,
        symbol: &str,
        side: Side,
        orders: &[OpenOrder],
        events: &mut Vec<StageEvent>,
    ) -> bool {
        let stops = stops_for(orders, side);
        let mut order_ids = Vec::new();
        let mut all_gone = true;
        for order in stops {
            match self.exchange.cancel_order(symbol, &order.id).await {
                Ok(()) | Err(ExchangeError::NotFound(_)) => {
                    info!(symbol, %side, order_id = %order.id, "remaining stop-loss canceled");
                    order_ids.push(order.id.clone());
                }
                Err(e) => {
                    warn!(symbol, %side, order_id = %order.id, error = %e, "failed to cancel remaining stop");
                    all_gone = false;
                }
            }
        }
        if !order_ids.is_empty() {
            events.push(StageEvent::StopsCanceled { side, order_ids });
        }
        all_gone
    }
}
