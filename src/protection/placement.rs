// =============================================================================
// Order Placement — entry plus the full protective set
// =============================================================================
//
// Sequence for a new position:
//   1. Market entry.
//   2. One stop-loss for the full quantity. On rejection, a single retry with
//      the trigger pushed `stop_retry_ticks` further from entry. If that also
//      fails the position is flattened at market; a failed flatten is logged
//      as critical.
//   3. One take-profit per plan leg. Failures are logged and left to the
//      reconciler; the position is already protected by its stop.
//
// Every trigger is buffered away from both entry and the current price.
// =============================================================================

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, instrument, warn};

use super::plan::ExitPlan;
use super::stop_replace::stop_request;
use super::triggers::TriggerBuffer;
use crate::error::{ExchangeError, PlacementError};
use crate::exchange::{Exchange, SymbolRules};
use crate::runtime_config::ProtectionConfig;
use crate::types::{OrderHandle, OrderRequest};

#[derive(Debug, Clone, Serialize)]
pub struct PlacementReport {
    pub entry: OrderHandle,
    pub stop: OrderHandle,
    pub stop_trigger: f64,
    /// Stop was only accepted on the widened retry.
    pub stop_retried: bool,
    pub take_profits: Vec<OrderHandle>,
    /// Plan leg indexes whose take-profit was not placed.
    pub missing_take_profits: Vec<usize>,
}

pub struct OrderPlacer {
    exchange: Arc<dyn Exchange>,
    cfg: ProtectionConfig,
    hedge: bool,
}

impl OrderPlacer {
    pub fn new(exchange: Arc<dyn Exchange>, cfg: ProtectionConfig, hedge: bool) -> Self {
        Self { exchange, cfg, hedge }
    }

    #[instrument(skip(self, plan, rules), fields(symbol = %plan.symbol, side = %plan.side, qty = plan.quantity))]
    pub async fn place(
        &self,
        plan: &ExitPlan,
        rules: &SymbolRules,
    ) -> Result<PlacementReport, PlacementError> {
        if plan.quantity <= 0.0 || plan.legs.is_empty() {
            return Err(PlacementError::Skipped("empty plan".to_string()));
        }
        let symbol = plan.symbol.as_str();
        let side = plan.side;

        // ── 1. Entry ────────────────────────────────────────────────────
        let entry_req = OrderRequest::market_entry(symbol, side, plan.quantity, self.hedge);
        let entry = self
            .exchange
            .create_order(&entry_req)
            .await
            .map_err(PlacementError::EntryFailed)?;
        info!(order_id = %entry.order_id, "entry filled");

        let last = match self.exchange.last_price(symbol).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "last price unavailable; buffering against entry only");
                plan.entry_price
            }
        };
        let anchors = [plan.entry_price, last];
        let buffer = TriggerBuffer::from_config(&self.cfg);

        // ── 2. Stop-loss (with one widened retry) ───────────────────────
        let stop_trigger = buffer.stop_trigger(side, plan.initial_stop, &anchors, rules);
        let (stop, stop_trigger, stop_retried) = match self.place_stop(plan, stop_trigger).await {
            Ok(handle) => (handle, stop_trigger, false),
            Err(first) => {
                let widened =
                    TriggerBuffer::widen_stop(side, stop_trigger, self.cfg.stop_retry_ticks, rules);
                warn!(error = %first, trigger = stop_trigger, retry_trigger = widened, "stop-loss rejected; retrying wider");
                match self.place_stop(plan, widened).await {
                    Ok(handle) => (handle, widened, true),
                    Err(second) => return Err(self.flatten(plan, second).await),
                }
            }
        };
        info!(order_id = %stop.order_id, trigger = stop_trigger, "stop-loss placed");

        // ── 3. Take-profit legs ─────────────────────────────────────────
        let mut take_profits = Vec::with_capacity(plan.legs.len());
        let mut missing_take_profits = Vec::new();
        for (i, leg) in plan.legs.iter().enumerate() {
            let trigger = buffer.take_profit_trigger(side, leg.price, &anchors, rules);
            let req = OrderRequest::take_profit(symbol, side, leg.quantity, trigger, i + 1, self.hedge);
            match self.exchange.create_order(&req).await {
                Ok(handle) => {
                    info!(leg = i + 1, order_id = %handle.order_id, trigger, qty = leg.quantity, "take-profit placed");
                    take_profits.push(handle);
                }
                Err(e) => {
                    warn!(leg = i + 1, trigger, error = %e, "take-profit failed; reconciler will retry");
                    missing_take_profits.push(i);
                }
            }
        }

        Ok(PlacementReport {
            entry,
            stop,
            stop_trigger,
            stop_retried,
            take_profits,
            missing_take_profits,
        })
    }

    async fn place_stop(&self, plan: &ExitPlan, trigger: f64) -> Result<OrderHandle, ExchangeError> {
        let req = stop_request(
            &plan.symbol,
            plan.side,
            plan.quantity,
            trigger,
            self.cfg.use_close_position_stop,
            self.hedge,
        );
        self.exchange.create_order(&req).await
    }

    /// Close the unprotectable position at market.
    async fn flatten(&self, plan: &ExitPlan, stop_error: ExchangeError) -> PlacementError {
        let req = OrderRequest::market_flatten(&plan.symbol, plan.side, plan.quantity, self.hedge);
        match self.exchange.create_order(&req).await {
            Ok(handle) => {
                warn!(order_id = %handle.order_id, error = %stop_error, "stop-loss impossible; position flattened");
                PlacementError::Flattened { stop_error }
            }
            Err(flatten_error) => {
                error!(
                    critical = true,
                    stop_error = %stop_error,
                    flatten_error = %flatten_error,
                    "UNPROTECTED POSITION: stop-loss and flatten both failed"
                );
                PlacementError::Unprotected {
                    stop_error,
                    flatten_error,
                }
            }
        }
    }
}
