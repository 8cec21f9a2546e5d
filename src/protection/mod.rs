// =============================================================================
// Protection engine
// =============================================================================
//
// Placement opens a position with its full protective set; the stage
// tracker, trailing controller, reconciler and orphan sweeper then keep that
// set correct on their own intervals. All of them act on a symbol only while
// holding its lock from the `SymbolBook`.
// =============================================================================

pub mod orphan;
pub mod placement;
pub mod plan;
pub mod reconciler;
pub mod stage_tracker;
pub mod stop_replace;
pub mod trailing;
pub mod triggers;

#[cfg(test)]
mod scenario_tests;

pub use orphan::OrphanSweeper;
pub use placement::OrderPlacer;
pub use reconciler::Reconciler;
pub use stage_tracker::StageTracker;
pub use trailing::TrailingController;
