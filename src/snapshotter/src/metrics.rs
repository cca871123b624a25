//! Run metrics
//!
//! Lock-free counters shared by clone between the orchestrator and its
//! caller, summarised in the log at the end of a run.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::info;

/// Thread-safe counters for one or more runs
#[derive(Debug, Clone, Default)]
pub struct RunMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Debug, Default)]
struct MetricsInner {
    /// Snapshots created
    snapshots_created: AtomicUsize,
    /// Snapshots deleted
    snapshots_deleted: AtomicUsize,
    /// Snapshot deletions that failed
    deletion_failures: AtomicUsize,
    /// Archives pushed to a destination
    archives_created: AtomicUsize,
    /// Archives removed from a destination
    archives_pruned: AtomicUsize,
    /// Failed pushes, prunes, listings and compactions
    archive_failures: AtomicUsize,
    /// Hooks that exited non-zero
    hook_failures: AtomicUsize,
}

impl RunMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_snapshot_created(&self) {
        self.inner.snapshots_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_snapshot_deleted(&self) {
        self.inner.snapshots_deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_deletion_failure(&self) {
        self.inner.deletion_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_archive_created(&self) {
        self.inner.archives_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_archive_pruned(&self) {
        self.inner.archives_pruned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_archive_failure(&self) {
        self.inner.archive_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hook_failure(&self) {
        self.inner.hook_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshots_created(&self) -> usize {
        self.inner.snapshots_created.load(Ordering::Relaxed)
    }

    pub fn snapshots_deleted(&self) -> usize {
        self.inner.snapshots_deleted.load(Ordering::Relaxed)
    }

    pub fn deletion_failures(&self) -> usize {
        self.inner.deletion_failures.load(Ordering::Relaxed)
    }

    pub fn archives_created(&self) -> usize {
        self.inner.archives_created.load(Ordering::Relaxed)
    }

    pub fn archives_pruned(&self) -> usize {
        self.inner.archives_pruned.load(Ordering::Relaxed)
    }

    pub fn archive_failures(&self) -> usize {
        self.inner.archive_failures.load(Ordering::Relaxed)
    }

    pub fn hook_failures(&self) -> usize {
        self.inner.hook_failures.load(Ordering::Relaxed)
    }

    /// Log all counters as one structured event.
    pub fn log_summary(&self) {
        info!(
            snapshots_created = self.snapshots_created(),
            snapshots_deleted = self.snapshots_deleted(),
            deletion_failures = self.deletion_failures(),
            archives_created = self.archives_created(),
            archives_pruned = self.archives_pruned(),
            archive_failures = self.archive_failures(),
            hook_failures = self.hook_failures(),
            "Run summary"
        );
    }
}
