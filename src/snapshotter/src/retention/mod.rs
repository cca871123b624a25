//! Time-bucketed retention of snapshots and their archives.
//!
//! ## Architecture
//!
//! - `bucket`: maps timestamps to bins anchored at a shared origin
//! - `policy`: retention rules and the evaluator producing a `RetentionPlan`
//!
//! ## Usage
//!
//! ```
//! use chrono::NaiveDate;
//! use snapshotter::retention::{RetentionEvaluator, RetentionRule, TimestampSet};
//! use std::time::Duration;
//!
//! let origin = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
//! let hour = Duration::from_secs(3600);
//! let evaluator = RetentionEvaluator::new(origin, vec![RetentionRule::new(hour, 2)]);
//!
//! let existing: TimestampSet = (0..4).map(|h| origin + chrono::TimeDelta::hours(h)).collect();
//! let plan = evaluator.evaluate(&existing, origin + chrono::TimeDelta::hours(3));
//! assert_eq!(plan.retain.len(), 2);
//! assert_eq!(plan.delete.len(), 2);
//! ```

pub mod bucket;
pub mod policy;

pub use bucket::{bin_index, same_bin};
pub use policy::{RetentionEvaluator, RetentionPlan, RetentionRule, TimestampSet, evaluate};
