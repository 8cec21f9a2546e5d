// =============================================================================
// Stop replacement — place the new stop, then cancel the old ones
// =============================================================================
//
// Ordering is the whole point: the new stop must be accepted before any old
// stop is canceled, so the position is never observed without a stop. If the
// new stop is rejected the old ones stay untouched. If a cancel fails the
// position briefly carries two stops; the reconciler collapses duplicates on
// its next pass.
// =============================================================================

use tracing::{debug, info, warn};

use super::triggers::TriggerBuffer;
use crate::error::ExchangeError;
use crate::exchange::Exchange;
use crate::runtime_config::ProtectionConfig;
use crate::types::{ExchangePosition, OpenOrder, OrderHandle, OrderRequest, Side};

/// Outcome of a successful replacement.
#[derive(Debug, Clone, PartialEq)]
pub struct StopReplacement {
    pub new_order: OrderHandle,
    pub trigger: f64,
    pub canceled: Vec<String>,
    /// Old stops whose cancel failed; still resting on the book.
    pub left_resting: Vec<String>,
}

/// Stop-loss request for a position of `size`, with close-position
/// semantics when `close_position` is set.
pub fn stop_request(
    symbol: &str,
    side: Side,
    size: f64,
    trigger: f64,
    close_position: bool,
    hedge: bool,
) -> OrderRequest {
    let qty = (!close_position).then_some(size);
    OrderRequest::stop_loss(symbol, side, qty, trigger, hedge)
}

/// Most protective trigger among `stops` for `side`.
pub fn tightest_stop(side: Side, stops: &[&OpenOrder]) -> Option<f64> {
    stops
        .iter()
        .filter_map(|o| o.trigger_price)
        .reduce(|a, b| side.tighter_stop(a, b))
}

/// Stop-loss orders on the book protecting `side`.
pub fn stops_for(orders: &[OpenOrder], side: Side) -> Vec<&OpenOrder> {
    orders
        .iter()
        .filter(|o| o.is_stop_loss() && o.target_side() == side)
        .collect()
}

pub async fn replace_stop(
    exchange: &dyn Exchange,
    req: &OrderRequest,
    old: &[&OpenOrder],
) -> Result<StopReplacement, ExchangeError> {
    let trigger = req.trigger_price.unwrap_or_default();

    let new_order = match exchange.create_order(req).await {
        Ok(handle) => handle,
        Err(e) => {
            warn!(
                symbol = %req.symbol,
                trigger,
                error = %e,
                "replacement stop rejected; keeping existing stop"
            );
            return Err(e);
        }
    };
    info!(
        symbol = %req.symbol,
        order_id = %new_order.order_id,
        trigger,
        "replacement stop placed"
    );

    let mut canceled = Vec::new();
    let mut left_resting = Vec::new();
    for order in old {
        match exchange.cancel_order(&order.symbol, &order.id).await {
            // Already gone (filled or canceled elsewhere): nothing to do.
            Ok(()) | Err(ExchangeError::NotFound(_)) => canceled.push(order.id.clone()),
            Err(e) => {
                warn!(
                    symbol = %order.symbol,
                    order_id = %order.id,
                    error = %e,
                    "failed to cancel superseded stop; left for reconciler"
                );
                left_resting.push(order.id.clone());
            }
        }
    }

    Ok(StopReplacement {
        new_order,
        trigger,
        canceled,
        left_resting,
    })
}

/// Result of trying to move a position's stop to a new level.
#[derive(Debug, Clone, PartialEq)]
pub enum RatchetOutcome {
    Moved(StopReplacement),
    /// The buffered target does not strictly improve the live stop.
    NotTighter { target: f64, current: f64 },
    Failed(ExchangeError),
}

/// Move the stop of `position` toward `desired`, never loosening it.
///
/// The target is clamped to stay clear of the last price, then compared with
/// the tightest stop on the book (or `known_stop` if the book shows none).
/// Only a strict improvement triggers a place-before-cancel replacement.
pub async fn ratchet_stop(
    exchange: &dyn Exchange,
    cfg: &ProtectionConfig,
    hedge: bool,
    position: &ExchangePosition,
    desired: f64,
    orders: &[OpenOrder],
    known_stop: Option<f64>,
) -> RatchetOutcome {
    let symbol = position.symbol.as_str();
    let side = position.side;

    let rules = match exchange.symbol_rules(symbol).await {
        Ok(r) => r,
        Err(e) => return RatchetOutcome::Failed(e),
    };
    let last = match exchange.last_price(symbol).await {
        Ok(p) => p,
        Err(e) => return RatchetOutcome::Failed(e),
    };
    let target = TriggerBuffer::from_config(cfg).stop_trigger(side, desired, &[last], &rules);

    let stops = stops_for(orders, side);
    let current = tightest_stop(side, &stops).or(known_stop);
    if let Some(current) = current {
        if !side.stop_improves(target, current) {
            debug!(symbol, %side, target, current, "stop already at or beyond target");
            return RatchetOutcome::NotTighter { target, current };
        }
    }

    let req = stop_request(
        symbol,
        side,
        position.size,
        target,
        cfg.use_close_position_stop,
        hedge,
    );
    match replace_stop(exchange, &req, &stops).await {
        Ok(done) => RatchetOutcome::Moved(done),
        Err(e) => RatchetOutcome::Failed(e),
    }
}
