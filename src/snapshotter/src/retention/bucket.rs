//! Discretization of the time axis into fixed-width bins.
//!
//! Bin `k` of a given width covers `[origin + k * width, origin + (k + 1) * width)`.
//! Indices are negative before the origin.

use chrono::{NaiveDateTime, TimeDelta};
use std::time::Duration;

/// Index of the bin of width `interval` containing `timestamp`.
///
/// Computed as `floor((timestamp - origin) / interval)` in whole nanoseconds,
/// so no drift accumulates however far `timestamp` is from `origin`.
pub fn bin_index(timestamp: NaiveDateTime, origin: NaiveDateTime, interval: Duration) -> i64 {
    // Zero widths are rejected by configuration validation.
    debug_assert!(!interval.is_zero(), "bin width must be positive");
    let width = i128::try_from(interval.as_nanos())
        .unwrap_or(i128::MAX)
        .max(1);
    let offset = delta_nanos(timestamp - origin);
    let index = offset.div_euclid(width);
    i64::try_from(index).unwrap_or(if index < 0 { i64::MIN } else { i64::MAX })
}

/// Whether two timestamps fall in the same bin.
pub fn same_bin(
    a: NaiveDateTime,
    b: NaiveDateTime,
    origin: NaiveDateTime,
    interval: Duration,
) -> bool {
    bin_index(a, origin, interval) == bin_index(b, origin, interval)
}

fn delta_nanos(delta: TimeDelta) -> i128 {
    i128::from(delta.num_seconds()) * 1_000_000_000 + i128::from(delta.subsec_nanos())
}
