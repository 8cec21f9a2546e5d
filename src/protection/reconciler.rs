// =============================================================================
// Protection Reconciler — periodic self-healing of stops and take-profits
// =============================================================================
//
// For every open position of a symbol, under the symbol lock:
//   1. Run the stage tracker's diff first, so a filled take-profit is
//      counted as a fill and never re-created as "missing".
//   2. Collapse duplicate stop-losses, keeping the most protective one.
//   3. Re-create a missing stop-loss at the tighter of the last stop this
//      engine placed and the plan's stop for the current stage. With neither
//      known, use `fallback_stop_pct` from the position's entry.
//   4. Restore the stage stop if the live stop is looser than the stage asks.
//   5. Re-create take-profit legs the plan still expects.
//
// Steps 3-5 respect a per-side cooldown so that exchange propagation delay
// does not turn into a retry storm.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::stage_tracker::{take_profit_count, StageTracker};
use super::stop_replace::{ratchet_stop, stop_request, stops_for, tightest_stop, RatchetOutcome};
use super::triggers::TriggerBuffer;
use crate::error::ExchangeError;
use crate::exchange::{Exchange, SymbolRules};
use crate::runtime_config::ProtectionConfig;
use crate::symbol_book::{LegState, ProtectionStatus, SymbolBook};
use crate::types::{ExchangePosition, OpenOrder, OrderRequest, Side};

/// Where a re-created stop took its price from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopSource {
    LastPlaced,
    PlanStage,
    Fallback,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Repair {
    StopRecreated { side: Side, trigger: f64, source: StopSource },
    StopRecreateFailed { side: Side, error: ExchangeError },
    DuplicateStopsCollapsed { side: Side, kept: String, canceled: Vec<String> },
    StageStopRestored { side: Side, trigger: f64 },
    TakeProfitRecreated { side: Side, leg: usize, trigger: f64 },
    TakeProfitRecreateFailed { side: Side, leg: usize, error: ExchangeError },
    CoolingDown { side: Side },
}

impl Repair {
    /// False for entries that only report a skipped pass.
    pub fn changed_orders(&self) -> bool {
        !matches!(self, Repair::CoolingDown { .. })
    }
}

pub struct Reconciler {
    exchange: Arc<dyn Exchange>,
    cfg: ProtectionConfig,
    hedge: bool,
    tracker: StageTracker,
}

impl Reconciler {
    pub fn new(exchange: Arc<dyn Exchange>, cfg: ProtectionConfig, hedge: bool) -> Self {
        let tracker = StageTracker::new(exchange.clone(), cfg.clone(), hedge);
        Self {
            exchange,
            cfg,
            hedge,
            tracker,
        }
    }

    pub async fn run_symbol(&self, book: &SymbolBook, symbol: &str) -> Result<Vec<Repair>, ExchangeError> {
        let mut state = book.lock(symbol).await;
        let positions = self.exchange.fetch_positions().await?;
        let mut orders = self.exchange.fetch_open_orders(symbol).await?;

        let events = self.tracker.sync(symbol, &mut state, &orders, &positions).await;
        if !events.is_empty() {
            orders = self.exchange.fetch_open_orders(symbol).await?;
        }

        let mine: Vec<&ExchangePosition> = positions
            .iter()
            .filter(|p| p.symbol == symbol && p.size > 0.0)
            .collect();
        if mine.is_empty() {
            return Ok(Vec::new());
        }
        let rules = self.exchange.symbol_rules(symbol).await?;
        let last = self.exchange.last_price(symbol).await?;

        let now = Utc::now();
        let mut repairs = Vec::new();
        for position in mine {
            let side = position.side;
            let leg = state.leg_mut(side);
            let before = repairs.len();

            self.collapse_duplicates(position, &orders, &mut repairs).await;

            if leg.in_repair_cooldown(now, self.cfg.repair_cooldown_secs) {
                debug!(symbol, %side, "repair cooldown active");
                repairs.push(Repair::CoolingDown { side });
            } else {
                if stops_for(&orders, side).is_empty() {
                    self.recreate_stop(position, leg, &rules, last, &mut repairs).await;
                } else {
                    self.restore_stage_stop(position, leg, &orders, &mut repairs).await;
                }
                self.recreate_take_profits(position, leg, &orders, &rules, last, &mut repairs)
                    .await;

                let repaired = repairs[before..].iter().any(|r| {
                    matches!(
                        r,
                        Repair::StopRecreated { .. }
                            | Repair::StageStopRestored { .. }
                            | Repair::TakeProfitRecreated { .. }
                    )
                });
                if repaired {
                    leg.last_repair_at = Some(now);
                }
            }

            let fresh = self.exchange.fetch_open_orders(symbol).await.unwrap_or_else(|_| orders.clone());
            book.publish(ProtectionStatus::from_leg(
                symbol,
                side,
                leg,
                take_profit_count(&fresh, side),
                position.size,
            ));
        }
        Ok(repairs)
    }

    async fn collapse_duplicates(
        &self,
        position: &ExchangePosition,
        orders: &[OpenOrder],
        repairs: &mut Vec<Repair>,
    ) {
        let side = position.side;
        let stops = stops_for(orders, side);
        if stops.len() < 2 {
            return;
        }
        let Some(best) = tightest_stop(side, &stops) else {
            return;
        };
        let Some(keep) = stops.iter().find(|o| o.trigger_price == Some(best)) else {
            return;
        };
        let mut canceled = Vec::new();
        for order in stops.iter().filter(|o| o.id != keep.id) {
            match self.exchange.cancel_order(&order.symbol, &order.id).await {
                Ok(()) | Err(ExchangeError::NotFound(_)) => canceled.push(order.id.clone()),
                Err(e) => warn!(symbol = %order.symbol, order_id = %order.id, error = %e, "duplicate stop cancel failed"),
            }
        }
        warn!(symbol = %position.symbol, %side, kept = %keep.id, canceled = canceled.len(), "collapsed duplicate stop-losses");
        repairs.push(Repair::DuplicateStopsCollapsed {
            side,
            kept: keep.id.clone(),
            canceled,
        });
    }

    async fn recreate_stop(
        &self,
        position: &ExchangePosition,
        leg: &mut LegState,
        rules: &SymbolRules,
        last: f64,
        repairs: &mut Vec<Repair>,
    ) {
        let side = position.side;
        let plan_stop = leg.plan.as_ref().and_then(|p| p.stop_for_stage(leg.stage));
        let (desired, source) = match (leg.live_stop, plan_stop) {
            (Some(live), Some(stage)) if side.stop_improves(stage, live) => (stage, StopSource::PlanStage),
            (Some(live), _) => (live, StopSource::LastPlaced),
            (None, Some(stage)) => (stage, StopSource::PlanStage),
            (None, None) => (
                position.entry_price * (1.0 - side.sign() * self.cfg.fallback_stop_pct / 100.0),
                StopSource::Fallback,
            ),
        };
        let trigger = TriggerBuffer::from_config(&self.cfg).stop_trigger(side, desired, &[last], rules);
        let req = stop_request(
            &position.symbol,
            side,
            position.size,
            trigger,
            self.cfg.use_close_position_stop,
            self.hedge,
        );
        match self.exchange.create_order(&req).await {
            Ok(handle) => {
                warn!(symbol = %position.symbol, %side, trigger, ?source, order_id = %handle.order_id, "missing stop-loss re-created");
                leg.live_stop = Some(trigger);
                repairs.push(Repair::StopRecreated { side, trigger, source });
            }
            Err(e) => {
                error!(symbol = %position.symbol, %side, trigger, error = %e, "position without stop-loss; re-create failed");
                repairs.push(Repair::StopRecreateFailed { side, error: e });
            }
        }
    }

    async fn restore_stage_stop(
        &self,
        position: &ExchangePosition,
        leg: &mut LegState,
        orders: &[OpenOrder],
        repairs: &mut Vec<Repair>,
    ) {
        let side = position.side;
        let Some(desired) = leg.plan.as_ref().and_then(|p| p.stop_for_stage(leg.stage)) else {
            return;
        };
        let current = tightest_stop(side, &stops_for(orders, side));
        if current.is_some_and(|c| !side.stop_improves(desired, c)) {
            return;
        }
        match ratchet_stop(
            self.exchange.as_ref(),
            &self.cfg,
            self.hedge,
            position,
            desired,
            orders,
            leg.live_stop,
        )
        .await
        {
            RatchetOutcome::Moved(done) => {
                warn!(symbol = %position.symbol, %side, stage = %leg.stage, trigger = done.trigger, "stage stop restored");
                leg.live_stop = Some(done.trigger);
                repairs.push(Repair::StageStopRestored { side, trigger: done.trigger });
            }
            RatchetOutcome::NotTighter { .. } => {}
            RatchetOutcome::Failed(e) => {
                warn!(symbol = %position.symbol, %side, error = %e, "stage stop restore failed");
            }
        }
    }

    async fn recreate_take_profits(
        &self,
        position: &ExchangePosition,
        leg: &mut LegState,
        orders: &[OpenOrder],
        rules: &SymbolRules,
        last: f64,
        repairs: &mut Vec<Repair>,
    ) {
        let side = position.side;
        let Some(plan) = leg.plan.as_ref() else {
            return;
        };
        let remaining = plan.remaining_legs(leg.stage);
        let existing: Vec<f64> = orders
            .iter()
            .filter(|o| o.is_take_profit() && o.target_side() == side)
            .filter_map(|o| o.trigger_price)
            .collect();
        let missing = remaining.len().saturating_sub(existing.len());
        if missing == 0 {
            return;
        }

        // Pair each resting take-profit with the nearest planned leg; the
        // unpaired legs are the missing ones.
        let mut paired = vec![false; remaining.len()];
        for trigger in &existing {
            let nearest = remaining
                .iter()
                .enumerate()
                .filter(|(i, _)| !paired[*i])
                .min_by(|(_, a), (_, b)| {
                    (a.price - trigger)
                        .abs()
                        .total_cmp(&(b.price - trigger).abs())
                })
                .map(|(i, _)| i);
            if let Some(i) = nearest {
                paired[i] = true;
            }
        }

        let buffer = TriggerBuffer::from_config(&self.cfg);
        let offset = leg.stage.value() as usize;
        let mut created = 0usize;
        for (i, tp) in remaining.iter().enumerate().filter(|(i, _)| !paired[*i]).take(missing) {
            let number = offset + i + 1;
            let qty = rules.round_quantity(tp.quantity.min(position.size));
            if qty <= 0.0 {
                continue;
            }
            let trigger = buffer.take_profit_trigger(side, tp.price, &[last], rules);
            let req = OrderRequest::take_profit(&position.symbol, side, qty, trigger, number, self.hedge);
            match self.exchange.create_order(&req).await {
                Ok(handle) => {
                    info!(symbol = %position.symbol, %side, leg = number, trigger, qty, order_id = %handle.order_id, "missing take-profit re-created");
                    created += 1;
                    repairs.push(Repair::TakeProfitRecreated { side, leg: number, trigger });
                }
                Err(e) => {
                    warn!(symbol = %position.symbol, %side, leg = number, error = %e, "take-profit re-create failed");
                    repairs.push(Repair::TakeProfitRecreateFailed { side, leg: number, error: e });
                }
            }
        }
        if created > 0 {
            // Our own additions are not fills; keep the tracker's baseline in
            // step.
            leg.last_tp_count = Some(existing.len() + created);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::PaperExchange;
    use crate::protection::placement::OrderPlacer;
    use crate::protection::plan::ExitPlan;
    use crate::protection::stage_tracker::StageEvent;
    use crate::types::{Decision, OrderKind};

    fn decision() -> Decision {
        Decision {
            symbol: "BTCUSDT".into(),
            side: Side::Long,
            entry_price: 100.0,
            initial_stop: 98.0,
            volatility_unit: 0.8,
            targets: vec![101.0, 102.0, 103.0],
            splits: vec![0.3, 0.3, 0.4],
        }
    }

    async fn opened(ex: &Arc<PaperExchange>, book: &SymbolBook) {
        let plan = ExitPlan::new(&decision(), 10.0, &SymbolRules::default()).unwrap();
        let report = OrderPlacer::new(ex.clone(), ProtectionConfig::default(), false)
            .place(&plan, &SymbolRules::default())
            .await
            .unwrap();
        book.lock("BTCUSDT")
            .await
            .legs
            .insert(Side::Long, LegState::for_entry(plan, report.stop_trigger, Utc::now()));
    }

    fn setup() -> (Arc<PaperExchange>, SymbolBook, Reconciler) {
        let ex = Arc::new(PaperExchange::new(10_000.0));
        ex.set_price("BTCUSDT", 100.0);
        let rec = Reconciler::new(ex.clone(), ProtectionConfig::default(), false);
        (ex, SymbolBook::new(), rec)
    }

    fn stop_ids(ex: &PaperExchange) -> Vec<OpenOrder> {
        ex.orders("BTCUSDT").into_iter().filter(|o| o.is_stop_loss()).collect()
    }

    #[tokio::test]
    async fn manually_canceled_stop_is_recreated_at_last_level() {
        let (ex, book, rec) = setup();
        opened(&ex, &book).await;
        let stop = stop_ids(&ex).remove(0);
        ex.remove_order(&stop.id);

        let repairs = rec.run_symbol(&book, "BTCUSDT").await.unwrap();
        assert!(repairs.contains(&Repair::StopRecreated {
            side: Side::Long,
            trigger: 98.0,
            source: StopSource::LastPlaced
        }));
        let stops = stop_ids(&ex);
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].quantity, Some(10.0));
    }

    #[tokio::test]
    async fn foreign_position_gets_fallback_stop() {
        let (ex, book, rec) = setup();
        ex.open_position("BTCUSDT", Side::Long, 0.5, 100.0);

        let repairs = rec.run_symbol(&book, "BTCUSDT").await.unwrap();
        assert_eq!(
            repairs,
            vec![Repair::StopRecreated { side: Side::Long, trigger: 98.0, source: StopSource::Fallback }]
        );
    }

    #[tokio::test]
    async fn missing_stop_takes_the_stage_level_when_the_move_was_rejected() {
        let (ex, book, rec) = setup();
        opened(&ex, &book).await;
        let tracker = StageTracker::new(ex.clone(), ProtectionConfig::default(), false);
        tracker.run_symbol(&book, "BTCUSDT").await.unwrap();

        // TP1 fills but the breakeven stop is refused; then the old stop vanishes.
        ex.fail_next(OrderKind::StopMarket, 1);
        ex.set_price("BTCUSDT", 101.1);
        let events = tracker.run_symbol(&book, "BTCUSDT").await.unwrap();
        assert!(events.iter().any(|e| matches!(e, StageEvent::StopMoveFailed { .. })));
        let stop = stop_ids(&ex).remove(0);
        assert_eq!(stop.trigger_price, Some(98.0));
        ex.remove_order(&stop.id);

        let repairs = rec.run_symbol(&book, "BTCUSDT").await.unwrap();
        assert!(repairs.contains(&Repair::StopRecreated {
            side: Side::Long,
            trigger: 100.0,
            source: StopSource::PlanStage
        }));
        assert_eq!(stop_ids(&ex)[0].trigger_price, Some(100.0));
    }

    #[tokio::test]
    async fn position_reopened_outside_the_engine_gets_a_fresh_stop() {
        let (ex, book, rec) = setup();
        opened(&ex, &book).await;

        // Stopped out, then a manual long far below the old trade.
        ex.set_price("BTCUSDT", 97.0);
        assert!(ex.positions().is_empty());
        ex.open_position("BTCUSDT", Side::Long, 0.5, 50.0);
        ex.set_price("BTCUSDT", 50.0);

        let repairs = rec.run_symbol(&book, "BTCUSDT").await.unwrap();
        assert_eq!(
            repairs,
            vec![Repair::StopRecreated { side: Side::Long, trigger: 49.0, source: StopSource::Fallback }]
        );
    }

    #[tokio::test]
    async fn cooldown_blocks_immediate_second_repair() {
        let (ex, book, rec) = setup();
        ex.open_position("BTCUSDT", Side::Long, 0.5, 100.0);
        rec.run_symbol(&book, "BTCUSDT").await.unwrap();

        let stop = stop_ids(&ex).remove(0);
        ex.remove_order(&stop.id);
        let repairs = rec.run_symbol(&book, "BTCUSDT").await.unwrap();
        assert_eq!(repairs, vec![Repair::CoolingDown { side: Side::Long }]);
        assert!(!repairs.iter().any(Repair::changed_orders));
        assert!(stop_ids(&ex).is_empty());

        book.lock("BTCUSDT").await.leg_mut(Side::Long).last_repair_at =
            Some(Utc::now() - chrono::Duration::seconds(60));
        rec.run_symbol(&book, "BTCUSDT").await.unwrap();
        assert_eq!(stop_ids(&ex).len(), 1);
    }

    #[tokio::test]
    async fn failed_entry_take_profit_is_completed_without_stage_change() {
        let (ex, book, rec) = setup();
        ex.fail_next(OrderKind::TakeProfitMarket, 1);
        opened(&ex, &book).await;
        assert_eq!(take_profit_count(&ex.orders("BTCUSDT"), Side::Long), 2);

        let repairs = rec.run_symbol(&book, "BTCUSDT").await.unwrap();
        assert!(repairs.contains(&Repair::TakeProfitRecreated { side: Side::Long, leg: 1, trigger: 101.0 }));
        assert_eq!(take_profit_count(&ex.orders("BTCUSDT"), Side::Long), 3);

        let tracker = StageTracker::new(ex.clone(), ProtectionConfig::default(), false);
        let events = tracker.run_symbol(&book, "BTCUSDT").await.unwrap();
        assert!(!events.iter().any(|e| matches!(e, StageEvent::Advanced { .. })));
    }

    #[tokio::test]
    async fn duplicate_stops_collapse_to_the_tightest() {
        let (ex, book, rec) = setup();
        opened(&ex, &book).await;
        ex.create_order(&stop_request("BTCUSDT", Side::Long, 10.0, 99.0, false, false))
            .await
            .unwrap();
        assert_eq!(stop_ids(&ex).len(), 2);

        let repairs = rec.run_symbol(&book, "BTCUSDT").await.unwrap();
        assert!(repairs.iter().any(|r| matches!(r, Repair::DuplicateStopsCollapsed { .. })));
        let stops = stop_ids(&ex);
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0].trigger_price, Some(99.0));
    }

    #[tokio::test]
    async fn healthy_position_needs_no_repair() {
        let (ex, book, rec) = setup();
        opened(&ex, &book).await;
        let repairs = rec.run_symbol(&book, "BTCUSDT").await.unwrap();
        assert!(repairs.is_empty());
        assert_eq!(ex.orders("BTCUSDT").len(), 4);
    }
}
