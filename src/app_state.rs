// =============================================================================
// Central Application State — Ratchet Warden
// =============================================================================
//
// Ties the workers, the decision inbox and the operator API together. The
// symbol book owns per-symbol protection state; everything here is
// bookkeeping the dashboard reads.
//
// Thread safety:
//   - Atomic counter for lock-free version tracking.
//   - parking_lot locks for the shared collections.
// =============================================================================

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::runtime_config::RuntimeConfig;
use crate::symbol_book::SymbolBook;
use crate::types::Decision;

/// Maximum number of recent errors to retain.
const MAX_RECENT_ERRORS: usize = 100;
/// Decisions waiting for the orchestrator beyond this are dropped oldest first.
const MAX_PENDING_DECISIONS: usize = 256;

// -----------------------------------------------------------------------------
// Records
// -----------------------------------------------------------------------------

/// A recorded error event for the dashboard error log.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorRecord {
    /// Worker or subsystem that raised it.
    pub source: String,
    pub symbol: Option<String>,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Heartbeat of one periodic worker.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStatus {
    pub name: String,
    pub cycles: u64,
    pub errors: u64,
    pub last_run: Option<DateTime<Utc>>,
    pub last_summary: Option<String>,
}

// =============================================================================
// AppState
// =============================================================================

/// Shared across all async tasks via `Arc<AppState>`.
pub struct AppState {
    /// Bumped on every mutation the dashboard cares about.
    pub state_version: AtomicU64,

    pub runtime_config: Arc<RwLock<RuntimeConfig>>,
    pub book: Arc<SymbolBook>,

    /// Bearer token for the authenticated API routes. `None` rejects them all.
    pub admin_token: Option<String>,

    decision_inbox: Mutex<VecDeque<Decision>>,
    recent_errors: RwLock<VecDeque<ErrorRecord>>,
    workers: RwLock<BTreeMap<String, WorkerStatus>>,

    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            state_version: AtomicU64::new(1),
            runtime_config: Arc::new(RwLock::new(config)),
            book: Arc::new(SymbolBook::new()),
            admin_token: None,
            decision_inbox: Mutex::new(VecDeque::new()),
            recent_errors: RwLock::new(VecDeque::new()),
            workers: RwLock::new(BTreeMap::new()),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn with_admin_token(mut self, token: Option<String>) -> Self {
        self.admin_token = token.filter(|t| !t.is_empty());
        self
    }

    // ── Version Management ──────────────────────────────────────────────

    pub fn increment_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    pub fn current_state_version(&self) -> u64 {
        self.state_version.load(Ordering::SeqCst)
    }

    // ── Decision Inbox ──────────────────────────────────────────────────

    /// Queue a decision for the next orchestrator cycle. Returns the number
    /// of decisions now pending.
    pub fn push_decision(&self, decision: Decision) -> usize {
        let mut inbox = self.decision_inbox.lock();
        inbox.push_back(decision);
        while inbox.len() > MAX_PENDING_DECISIONS {
            inbox.pop_front();
        }
        let pending = inbox.len();
        drop(inbox);
        self.increment_version();
        pending
    }

    pub fn drain_decisions(&self) -> Vec<Decision> {
        self.decision_inbox.lock().drain(..).collect()
    }

    pub fn pending_decisions(&self) -> usize {
        self.decision_inbox.lock().len()
    }

    // ── Error Logging ───────────────────────────────────────────────────

    /// Record an error. The ring is capped at [`MAX_RECENT_ERRORS`]; the
    /// oldest entry is evicted first.
    pub fn push_error(&self, source: &str, symbol: Option<&str>, message: impl Into<String>) {
        let record = ErrorRecord {
            source: source.to_string(),
            symbol: symbol.map(str::to_string),
            message: message.into(),
            at: Utc::now(),
        };

        let mut errors = self.recent_errors.write();
        errors.push_back(record);
        while errors.len() > MAX_RECENT_ERRORS {
            errors.pop_front();
        }
        drop(errors);

        if let Some(w) = self.workers.write().get_mut(source) {
            w.errors += 1;
        }
        self.increment_version();
    }

    /// Newest first.
    pub fn recent_errors(&self) -> Vec<ErrorRecord> {
        self.recent_errors.read().iter().rev().cloned().collect()
    }

    // ── Worker Heartbeats ───────────────────────────────────────────────

    pub fn record_cycle(&self, worker: &str, summary: impl Into<String>) {
        let mut workers = self.workers.write();
        let entry = workers.entry(worker.to_string()).or_insert_with(|| WorkerStatus {
            name: worker.to_string(),
            ..WorkerStatus::default()
        });
        entry.cycles += 1;
        entry.last_run = Some(Utc::now());
        entry.last_summary = Some(summary.into());
        drop(workers);
        self.increment_version();
    }

    pub fn workers(&self) -> Vec<WorkerStatus> {
        self.workers.read().values().cloned().collect()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Side;

    fn decision(symbol: &str) -> Decision {
        Decision {
            symbol: symbol.into(),
            side: Side::Long,
            entry_price: 100.0,
            initial_stop: 98.0,
            volatility_unit: 1.0,
            targets: vec![101.0],
            splits: vec![1.0],
        }
    }

    #[test]
    fn inbox_drains_in_arrival_order() {
        let state = AppState::new(RuntimeConfig::default());
        assert_eq!(state.push_decision(decision("BTCUSDT")), 1);
        assert_eq!(state.push_decision(decision("ETHUSDT")), 2);

        let drained = state.drain_decisions();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].symbol, "BTCUSDT");
        assert_eq!(state.pending_decisions(), 0);
    }

    #[test]
    fn error_ring_is_capped_and_newest_first() {
        let state = AppState::new(RuntimeConfig::default());
        for i in 0..(MAX_RECENT_ERRORS + 5) {
            state.push_error("reconciler", Some("BTCUSDT"), format!("boom {i}"));
        }
        let errors = state.recent_errors();
        assert_eq!(errors.len(), MAX_RECENT_ERRORS);
        assert_eq!(errors[0].message, format!("boom {}", MAX_RECENT_ERRORS + 4));
    }

    #[test]
    fn heartbeats_count_cycles_and_errors() {
        let state = AppState::new(RuntimeConfig::default());
        let v0 = state.current_state_version();
        state.record_cycle("orphan_sweeper", "3 symbols");
        state.record_cycle("orphan_sweeper", "3 symbols");
        state.push_error("orphan_sweeper", None, "fetch failed");

        let workers = state.workers();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].cycles, 2);
        assert_eq!(workers[0].errors, 1);
        assert!(workers[0].last_run.is_some());
        assert!(state.current_state_version() > v0);
    }
}
