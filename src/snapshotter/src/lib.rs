//! Btrfs snapshots with tiered, time-bucketed retention and borg archival.
//!
//! ## Architecture
//!
//! - `retention`: pure evaluation of retention rules over timestamps
//! - `inventory`: parses tool listings into timestamped entities
//! - `backend`: btrfs, borg and hook primitives behind async traits
//! - `orchestrator`: the run state machine tying everything together
//! - `metrics`: counters summarised at the end of a run

pub mod backend;
pub mod inventory;
pub mod metrics;
pub mod orchestrator;
pub mod retention;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use backend::{Backends, BackendError};
pub use metrics::RunMetrics;
pub use orchestrator::{
    RunError, RunFailure, RunOptions, RunOrchestrator, RunOutcome, RunPhase, RunReport,
};
pub use retention::{RetentionEvaluator, RetentionPlan, RetentionRule, TimestampSet};
