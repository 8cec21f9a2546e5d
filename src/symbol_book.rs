// =============================================================================
// Symbol Book — per-symbol locks and protection state
// =============================================================================
//
// Every worker that touches a symbol's protective orders must hold that
// symbol's lock across the whole "read open orders -> decide -> act"
// sequence. Locks are async (`tokio::sync::Mutex`) because the critical
// section spans exchange calls; the registry of locks itself is a
// `parking_lot::RwLock` that is only held for map lookups.
//
// The state behind each lock is the only local mutable state of the engine:
// per position side, the exit plan, the exit stage, the last observed
// take-profit count and the last stop we placed. A read-only status snapshot
// is published after each worker pass for the HTTP surface.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::protection::plan::ExitPlan;
use crate::types::Side;

// ---------------------------------------------------------------------------
// ExitStage
// ---------------------------------------------------------------------------

/// Number of take-profit legs inferred filled, or terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct ExitStage(u8);

impl ExitStage {
    pub const TERMINAL: ExitStage = ExitStage(3);

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn is_terminal(self) -> bool {
        self == Self::TERMINAL
    }

    /// Stage after `fills` more legs filled out of `total_legs`. Never moves
    /// backwards; reaching `total_legs` is terminal.
    pub fn advanced(self, fills: usize, total_legs: usize) -> ExitStage {
        if self.is_terminal() {
            return self;
        }
        let next = (self.0 as usize + fills).min(total_legs);
        if next >= total_legs {
            Self::TERMINAL
        } else {
            ExitStage(next as u8).max(self)
        }
    }
}

impl std::fmt::Display for ExitStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_terminal() {
            write!(f, "terminal")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

// ---------------------------------------------------------------------------
// Per-side state
// ---------------------------------------------------------------------------

/// Engine state for one position side of a symbol.
#[derive(Debug, Clone, Default)]
pub struct LegState {
    pub plan: Option<ExitPlan>,
    pub stage: ExitStage,
    /// Take-profit count seen on the previous observation; `None` until the
    /// first sample after an entry.
    pub last_tp_count: Option<usize>,
    /// Trigger of the last stop-loss this engine placed.
    pub live_stop: Option<f64>,
    pub exits_placed_at: Option<DateTime<Utc>>,
    pub last_repair_at: Option<DateTime<Utc>>,
}

impl LegState {
    /// Fresh state for a brand-new entry. The only place the stage resets.
    pub fn for_entry(plan: ExitPlan, live_stop: f64, now: DateTime<Utc>) -> Self {
        Self {
            plan: Some(plan),
            stage: ExitStage::default(),
            last_tp_count: None,
            live_stop: Some(live_stop),
            exits_placed_at: Some(now),
            last_repair_at: None,
        }
    }

    /// Drop everything tied to the position that just went away. The stage
    /// is kept; only a fresh entry resets it.
    pub fn release(&mut self) {
        self.plan = None;
        self.live_stop = None;
        self.last_tp_count = None;
        self.exits_placed_at = None;
    }

    pub fn in_repair_cooldown(&self, now: DateTime<Utc>, cooldown_secs: u64) -> bool {
        self.last_repair_at
            .is_some_and(|t| (now - t).num_seconds() < cooldown_secs as i64)
    }

    pub fn placed_within(&self, now: DateTime<Utc>, secs: u64) -> bool {
        self.exits_placed_at
            .is_some_and(|t| (now - t).num_seconds() < secs as i64)
    }
}

/// All engine state for one symbol, guarded by the symbol lock.
#[derive(Debug, Default)]
pub struct SymbolState {
    pub legs: HashMap<Side, LegState>,
}

impl SymbolState {
    #[cfg(test)]
    pub fn leg(&self, side: Side) -> Option<&LegState> {
        self.legs.get(&side)
    }

    pub fn leg_mut(&mut self, side: Side) -> &mut LegState {
        self.legs.entry(side).or_default()
    }

    /// Exits for any side were placed within `secs`.
    pub fn recently_placed(&self, now: DateTime<Utc>, secs: u64) -> bool {
        self.legs.values().any(|l| l.placed_within(now, secs))
    }
}

// ---------------------------------------------------------------------------
// Published status
// ---------------------------------------------------------------------------

/// Read-only protection snapshot for one (symbol, side).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectionStatus {
    pub symbol: String,
    pub side: Side,
    pub stage: ExitStage,
    pub live_stop: Option<f64>,
    pub targets: Vec<f64>,
    pub open_take_profits: usize,
    pub position_size: f64,
    pub updated_at: DateTime<Utc>,
}

impl ProtectionStatus {
    pub fn from_leg(
        symbol: &str,
        side: Side,
        leg: &LegState,
        open_take_profits: usize,
        position_size: f64,
    ) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            stage: leg.stage,
            live_stop: leg.live_stop,
            targets: leg
                .plan
                .as_ref()
                .map(|p| p.legs.iter().map(|l| l.price).collect())
                .unwrap_or_default(),
            open_take_profits,
            position_size,
            updated_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// SymbolBook
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct SymbolBook {
    slots: RwLock<HashMap<String, Arc<Mutex<SymbolState>>>>,
    status: RwLock<HashMap<(String, Side), ProtectionStatus>>,
}

impl SymbolBook {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, symbol: &str) -> Arc<Mutex<SymbolState>> {
        if let Some(slot) = self.slots.read().get(symbol) {
            return Arc::clone(slot);
        }
        let mut slots = self.slots.write();
        Arc::clone(slots.entry(symbol.to_string()).or_default())
    }

    /// Acquire the symbol lock. The guard owns its slot so it can be held
    /// across awaits without borrowing the book.
    pub async fn lock(&self, symbol: &str) -> OwnedMutexGuard<SymbolState> {
        self.slot(symbol).lock_owned().await
    }

    /// Symbols that have ever been locked.
    pub fn symbols(&self) -> Vec<String> {
        let mut syms: Vec<String> = self.slots.read().keys().cloned().collect();
        syms.sort();
        syms
    }

    pub fn publish(&self, status: ProtectionStatus) {
        self.status
            .write()
            .insert((status.symbol.clone(), status.side), status);
    }

    pub fn statuses(&self) -> Vec<ProtectionStatus> {
        let mut all: Vec<ProtectionStatus> = self.status.read().values().cloned().collect();
        all.sort_by(|a, b| a.symbol.cmp(&b.symbol).then(a.side.as_position_side().cmp(b.side.as_position_side())));
        all
    }

    #[cfg(test)]
    pub fn status(&self, symbol: &str, side: Side) -> Option<ProtectionStatus> {
        self.status.read().get(&(symbol.to_string(), side)).cloned()
    }
}
