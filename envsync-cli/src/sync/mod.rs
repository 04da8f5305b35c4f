//! Sync engine
//!
//! One run flows through these stages: direction resolution, override
//! and skip parsing, per-configuration diffing, state reconciliation and
//! the orchestrated apply, ending in a run report.

pub mod branch;
pub mod diff;
pub mod direction;
pub mod orchestrator;
pub mod overrides;
pub mod report;
pub mod skip;
pub mod state;

#[cfg(test)]
pub mod testing;

pub use orchestrator::{RunContext, SyncOrchestrator};
pub use state::FileStateStore;
