//! Run Orchestrator
//!
//! Drives one execution: snapshot the source volume between its hooks, take
//! the inventory, evaluate retention, then delete and archive accordingly.
//!
//! ## Failure handling
//!
//! - Configuration, source discovery, pre-hook and snapshot creation
//!   failures are fatal and abort the run before anything is deleted
//! - Post-hook, deletion and per-destination archive failures are recorded
//!   in the [`RunReport`] and the run carries on
//! - A destination that cannot be listed is skipped for the whole run
//!
//! Dry-run mode performs every listing for real and logs each mutation
//! instead of performing it.

use chrono::{Local, NaiveDateTime};
use common::{ArchiveConfig, ConfigError, Configuration, TimestampError};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::backend::{ArchiveRequest, BackendError, Backends, MountSource};
use crate::inventory::{InventoryAdapter, NamedEntities, timestamps};
use crate::metrics::RunMetrics;
use crate::retention::{RetentionEvaluator, RetentionPlan, TimestampSet};

/// States of one run, in the order they are reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Start,
    PreHooksDone,
    CreateSnapshot,
    SnapshotReady,
    InventoryTaken,
    PlanComputed,
    DeletionsApplied,
    ArchivesApplied,
    Done,
    Failed,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunPhase::Start => "START",
            RunPhase::PreHooksDone => "PRE_HOOKS_DONE",
            RunPhase::CreateSnapshot => "CREATE_SNAPSHOT",
            RunPhase::SnapshotReady => "SNAPSHOT_READY",
            RunPhase::InventoryTaken => "INVENTORY_TAKEN",
            RunPhase::PlanComputed => "PLAN_COMPUTED",
            RunPhase::DeletionsApplied => "DELETIONS_APPLIED",
            RunPhase::ArchivesApplied => "ARCHIVES_APPLIED",
            RunPhase::Done => "DONE",
            RunPhase::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Log mutations instead of performing them.
    pub dry_run: bool,
    /// Do not take a new snapshot; evaluate the existing ones.
    pub skip_creation: bool,
}

/// A recoverable failure. The run continued after it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RunFailure {
    #[error("Post-hook `{command}` failed: {error}")]
    PostHook { command: String, error: String },

    #[error("Failed to delete snapshot {snapshot}: {error}")]
    Deletion { snapshot: String, error: String },

    #[error("Failed to list archives of {destination}: {error}")]
    ArchiveInventory { destination: String, error: String },

    #[error("Failed to archive {archive} to {destination}: {error}")]
    Archive {
        destination: String,
        archive: String,
        error: String,
    },

    #[error("Failed to prune {archive} from {destination}: {error}")]
    Prune {
        destination: String,
        archive: String,
        error: String,
    },

    #[error("Failed to compact {destination}: {error}")]
    Compact { destination: String, error: String },
}

/// A failure that aborted the run.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid run timestamp: {0}")]
    Timestamp(#[from] TimestampError),

    #[error("Source volume unavailable: {0}")]
    SourceUnavailable(#[source] BackendError),

    #[error("Pre-hook `{command}` failed: {source}")]
    PreHook {
        command: String,
        source: BackendError,
    },

    #[error("Failed to create snapshot {snapshot}: {source}")]
    Snapshot {
        snapshot: String,
        source: BackendError,
    },

    #[error("Failed to list snapshots: {0}")]
    Inventory(#[source] BackendError),
}

impl RunError {
    /// Phase the run was in when it failed.
    pub fn phase(&self) -> RunPhase {
        match self {
            RunError::Config(_)
            | RunError::Timestamp(_)
            | RunError::SourceUnavailable(_)
            | RunError::PreHook { .. } => RunPhase::Start,
            RunError::Snapshot { .. } => RunPhase::CreateSnapshot,
            RunError::Inventory(_) => RunPhase::SnapshotReady,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    PartialFailure,
}

impl RunOutcome {
    /// Process exit status: 0 on success, 3 when some step failed.
    pub fn exit_code(self) -> u8 {
        match self {
            RunOutcome::Success => 0,
            RunOutcome::PartialFailure => 3,
        }
    }
}

/// What a completed run did.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Run start time at the resolution of the datetime format.
    pub timestamp: NaiveDateTime,
    /// Snapshot taken by this run, if any.
    pub created: Option<NaiveDateTime>,
    /// Reference time retention was evaluated at.
    pub now: NaiveDateTime,
    pub plan: RetentionPlan,
    pub phases: Vec<RunPhase>,
    pub failures: Vec<RunFailure>,
    /// Destinations compacted after pruning, or that would be in dry-run.
    pub compacted: Vec<String>,
    pub dry_run: bool,
}

impl RunReport {
    fn new(timestamp: NaiveDateTime, dry_run: bool) -> Self {
        Self {
            timestamp,
            created: None,
            now: timestamp,
            plan: RetentionPlan::default(),
            phases: Vec::new(),
            failures: Vec::new(),
            compacted: Vec::new(),
            dry_run,
        }
    }

    fn enter(&mut self, phase: RunPhase) {
        info!(phase = %phase, "Entering phase");
        self.phases.push(phase);
    }

    pub fn outcome(&self) -> RunOutcome {
        if self.failures.is_empty() {
            RunOutcome::Success
        } else {
            RunOutcome::PartialFailure
        }
    }

    pub fn exit_code(&self) -> u8 {
        self.outcome().exit_code()
    }
}

/// Executes runs for one configuration.
pub struct RunOrchestrator {
    source_path: PathBuf,
    root_mnt: PathBuf,
    pre: Vec<String>,
    post: Vec<String>,
    skip_redundant: bool,
    archive: ArchiveConfig,
    evaluator: RetentionEvaluator,
    inventory: InventoryAdapter,
    backends: Backends,
    options: RunOptions,
    metrics: RunMetrics,
}

impl RunOrchestrator {
    pub fn new(
        config: &Configuration,
        options: RunOptions,
        backends: Backends,
        metrics: RunMetrics,
    ) -> Result<Self, RunError> {
        config.validate()?;
        let evaluator = RetentionEvaluator::from_keeps(config.time_origin()?, &config.keeps);
        let inventory = InventoryAdapter::new(
            backends.snapshots.clone(),
            backends.archives.clone(),
            config.timestamp_format()?,
            config.btrfs.prefix.clone(),
            config.borg.prefix.clone(),
        );

        for rule in evaluator.rules() {
            debug!(rule = %rule, "Retention rule");
        }

        Ok(Self {
            source_path: config.btrfs.source_path.clone(),
            root_mnt: config.btrfs.root_mnt.clone(),
            pre: config.btrfs.pre.clone(),
            post: config.btrfs.post.clone(),
            skip_redundant: config.btrfs.skip_redundant,
            archive: config.borg.clone(),
            evaluator,
            inventory,
            backends,
            options,
            metrics,
        })
    }

    /// Run now.
    pub async fn run(&self) -> Result<RunReport, RunError> {
        self.run_at(Local::now().naive_local()).await
    }

    /// Run as if started at `started`.
    pub async fn run_at(&self, started: NaiveDateTime) -> Result<RunReport, RunError> {
        let result = self.execute(started).await;
        match &result {
            Ok(report) => {
                self.metrics.log_summary();
                match report.outcome() {
                    RunOutcome::Success => info!(dry_run = report.dry_run, "Run completed"),
                    RunOutcome::PartialFailure => {
                        for failure in &report.failures {
                            warn!(failure = %failure, "Run failure");
                        }
                        warn!(
                            failures = report.failures.len(),
                            "Run completed with failures"
                        );
                    }
                }
            }
            Err(e) => {
                self.metrics.log_summary();
                error!(phase = %e.phase(), error = %e, "Run failed");
                info!(phase = %RunPhase::Failed, "Entering phase");
            }
        }
        result
    }

    async fn execute(&self, started: NaiveDateTime) -> Result<RunReport, RunError> {
        let timestamp = self.inventory.format().truncate(started)?;
        let mut report = RunReport::new(timestamp, self.options.dry_run);
        report.enter(RunPhase::Start);
        info!(
            timestamp = %timestamp,
            dry_run = self.options.dry_run,
            skip_creation = self.options.skip_creation,
            "Starting run"
        );

        let source = self
            .backends
            .snapshots
            .locate_source(&self.source_path)
            .await
            .map_err(RunError::SourceUnavailable)?;
        info!(
            device = %source.device,
            subvolume = %source.subvolume,
            "Located source volume"
        );

        if self.options.skip_creation {
            info!("Skipping snapshot creation");
            let failures = self.run_post_hooks().await;
            report.failures.extend(failures);
        } else if self.skip_redundant && self.is_redundant(timestamp).await? {
            info!(
                timestamp = %timestamp,
                "No retention rule would keep a new snapshot, skipping creation"
            );
        } else {
            self.take_snapshot(timestamp, &mut report).await?;
            report.created = Some(timestamp);
        }
        report.enter(RunPhase::SnapshotReady);

        let mut snapshots = self
            .inventory
            .list_snapshots(&self.source_path)
            .await
            .map_err(RunError::Inventory)?;
        if let Some(created) = report.created {
            snapshots
                .entry(created)
                .or_insert_with(|| self.inventory.snapshot_name(created));
        }
        let archives = self.list_destinations(&mut report).await;
        report.enter(RunPhase::InventoryTaken);

        let existing = timestamps(&snapshots);
        report.now = match report.created {
            Some(created) => created,
            None if self.options.skip_creation => existing.last().copied().unwrap_or(timestamp),
            None => timestamp,
        };
        report.plan = self.plan(&existing, report.now, report.created, &archives);
        report.enter(RunPhase::PlanComputed);

        let failures = self.apply_deletions(&report.plan.delete, &snapshots).await;
        report.failures.extend(failures);
        report.enter(RunPhase::DeletionsApplied);

        report.compacted = self
            .apply_archives(
                &report.plan,
                &snapshots,
                &archives,
                &source,
                &mut report.failures,
            )
            .await;
        report.enter(RunPhase::ArchivesApplied);

        report.enter(RunPhase::Done);
        Ok(report)
    }

    /// Whether no rule would keep a snapshot taken at `timestamp`.
    async fn is_redundant(&self, timestamp: NaiveDateTime) -> Result<bool, RunError> {
        let snapshots = self
            .inventory
            .list_snapshots(&self.source_path)
            .await
            .map_err(RunError::Inventory)?;
        let mut existing = timestamps(&snapshots);
        existing.insert(timestamp);
        let plan = self.evaluator.evaluate(&existing, timestamp);
        Ok(!plan.retain.contains(&timestamp))
    }

    async fn take_snapshot(
        &self,
        timestamp: NaiveDateTime,
        report: &mut RunReport,
    ) -> Result<(), RunError> {
        for command in &self.pre {
            if let Err(source) = self.run_hook(command).await {
                error!(hook = %command, error = %source, "Pre-hook failed, not taking a snapshot");
                self.run_post_hooks().await;
                return Err(RunError::PreHook {
                    command: command.clone(),
                    source,
                });
            }
        }
        report.enter(RunPhase::PreHooksDone);
        report.enter(RunPhase::CreateSnapshot);

        let name = self.inventory.snapshot_name(timestamp);
        let target = self.root_mnt.join(&name);
        if self.options.dry_run {
            info!(
                source = %self.source_path.display(),
                target = %target.display(),
                "[DRY RUN] Would create read-only snapshot"
            );
        } else {
            info!(snapshot = %name, "Creating snapshot");
            if let Err(source) = self
                .backends
                .snapshots
                .create_snapshot(&self.source_path, &target)
                .await
            {
                self.run_post_hooks().await;
                return Err(RunError::Snapshot {
                    snapshot: name,
                    source,
                });
            }
            self.metrics.record_snapshot_created();
        }

        let failures = self.run_post_hooks().await;
        report.failures.extend(failures);
        Ok(())
    }

    async fn run_hook(&self, command: &str) -> Result<(), BackendError> {
        if self.options.dry_run {
            info!(hook = %command, "[DRY RUN] Would run hook");
            return Ok(());
        }
        let result = self.backends.hooks.run_hook(command).await;
        if result.is_err() {
            self.metrics.record_hook_failure();
        }
        result
    }

    /// Run every post-hook, whatever happened before.
    async fn run_post_hooks(&self) -> Vec<RunFailure> {
        let mut failures = Vec::new();
        for command in &self.post {
            if let Err(e) = self.run_hook(command).await {
                warn!(hook = %command, error = %e, "Post-hook failed");
                failures.push(RunFailure::PostHook {
                    command: command.clone(),
                    error: e.to_string(),
                });
            }
        }
        failures
    }

    /// Archive inventories of every reachable destination.
    async fn list_destinations(&self, report: &mut RunReport) -> BTreeMap<String, NamedEntities> {
        let mut inventories = BTreeMap::new();
        if !self.archive.is_enabled() {
            debug!("No archive destinations configured");
            return inventories;
        }
        for destination in &self.archive.repositories {
            match self.inventory.list_archives(destination).await {
                Ok(archives) => {
                    inventories.insert(destination.clone(), archives);
                }
                Err(e) => {
                    warn!(
                        destination = %destination,
                        error = %e,
                        "Cannot list archives, skipping destination for this run"
                    );
                    self.metrics.record_archive_failure();
                    report.failures.push(RunFailure::ArchiveInventory {
                        destination: destination.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        inventories
    }

    fn plan(
        &self,
        existing: &TimestampSet,
        now: NaiveDateTime,
        created: Option<NaiveDateTime>,
        archives: &BTreeMap<String, NamedEntities>,
    ) -> RetentionPlan {
        let mut plan = self.evaluator.evaluate(existing, now);
        if let Some(created) = created {
            if plan.protect(created) {
                info!(
                    timestamp = %created,
                    "Keeping the snapshot taken by this run until the next run"
                );
            }
        }

        let inventories: BTreeMap<String, TimestampSet> = archives
            .iter()
            .map(|(destination, entities)| (destination.clone(), timestamps(entities)))
            .collect();
        plan.schedule_archives(&inventories);

        info!(
            now = %now,
            existing = existing.len(),
            retain = plan.retain.len(),
            delete = plan.delete.len(),
            archive_candidates = plan.archive_candidates.len(),
            "Computed retention plan"
        );
        for timestamp in &plan.retain {
            debug!(timestamp = %timestamp, "Retaining snapshot");
        }
        plan
    }

    async fn apply_deletions(
        &self,
        delete: &TimestampSet,
        snapshots: &NamedEntities,
    ) -> Vec<RunFailure> {
        let mut failures = Vec::new();
        for name in delete.iter().filter_map(|timestamp| snapshots.get(timestamp)) {
            let path = self.root_mnt.join(name);
            if self.options.dry_run {
                info!(path = %path.display(), "[DRY RUN] Would delete snapshot");
                continue;
            }
            info!(snapshot = %name, "Deleting snapshot");
            match self.backends.snapshots.delete_subvolume(&path).await {
                Ok(()) => self.metrics.record_snapshot_deleted(),
                Err(e) => {
                    warn!(snapshot = %name, error = %e, "Failed to delete snapshot");
                    self.metrics.record_deletion_failure();
                    failures.push(RunFailure::Deletion {
                        snapshot: name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        failures
    }

    /// Push missing archives, then prune and compact, one destination at a
    /// time in configuration order. Returns the destinations compacted.
    async fn apply_archives(
        &self,
        plan: &RetentionPlan,
        snapshots: &NamedEntities,
        archives: &BTreeMap<String, NamedEntities>,
        source: &MountSource,
        failures: &mut Vec<RunFailure>,
    ) -> Vec<String> {
        let mut compacted = Vec::new();
        for destination in &self.archive.repositories {
            let (Some(needed), Some(existing)) = (
                plan.archive_needed.get(destination),
                archives.get(destination),
            ) else {
                continue;
            };

            for timestamp in needed {
                let Some(snapshot) = snapshots.get(timestamp) else {
                    continue;
                };
                if let Err(failure) = self
                    .push_archive(destination, *timestamp, snapshot, source)
                    .await
                {
                    failures.push(failure);
                }
            }

            if self.archive.prune
                && self
                    .prune_destination(destination, plan, existing, failures)
                    .await
            {
                compacted.push(destination.clone());
            }
        }
        compacted
    }

    async fn push_archive(
        &self,
        destination: &str,
        timestamp: NaiveDateTime,
        snapshot: &str,
        source: &MountSource,
    ) -> Result<(), RunFailure> {
        let archive = self.inventory.archive_name(timestamp);
        if self.options.dry_run {
            info!(
                destination = %destination,
                archive = %archive,
                snapshot = %snapshot,
                "[DRY RUN] Would create archive"
            );
            return Ok(());
        }

        info!(destination = %destination, archive = %archive, "Creating archive");
        let request = ArchiveRequest {
            repository: destination,
            archive: &archive,
            snapshot,
            timestamp,
            device: &source.device,
            paths: &self.archive.paths,
            extra: &self.archive.extra,
        };
        match self.backends.archives.create_archive(&request).await {
            Ok(()) => {
                self.metrics.record_archive_created();
                Ok(())
            }
            Err(e) => {
                warn!(
                    destination = %destination,
                    archive = %archive,
                    error = %e,
                    "Failed to create archive"
                );
                self.metrics.record_archive_failure();
                Err(RunFailure::Archive {
                    destination: destination.to_string(),
                    archive,
                    error: e.to_string(),
                })
            }
        }
    }

    /// Delete archives no rule selects any more, then compact the repository
    /// if anything was deleted. Returns whether it was compacted.
    async fn prune_destination(
        &self,
        destination: &str,
        plan: &RetentionPlan,
        existing: &NamedEntities,
        failures: &mut Vec<RunFailure>,
    ) -> bool {
        if plan.archive_candidates.is_empty() {
            debug!(destination = %destination, "No archive candidates, not pruning");
            return false;
        }
        let Some(excess) = plan.archive_prune.get(destination) else {
            return false;
        };

        let mut pruned = 0usize;
        for archive in excess.iter().filter_map(|timestamp| existing.get(timestamp)) {
            if self.options.dry_run {
                info!(
                    destination = %destination,
                    archive = %archive,
                    "[DRY RUN] Would delete archive"
                );
                pruned += 1;
                continue;
            }
            info!(destination = %destination, archive = %archive, "Deleting archive");
            match self
                .backends
                .archives
                .delete_archive(destination, archive)
                .await
            {
                Ok(()) => {
                    self.metrics.record_archive_pruned();
                    pruned += 1;
                }
                Err(e) => {
                    warn!(
                        destination = %destination,
                        archive = %archive,
                        error = %e,
                        "Failed to delete archive"
                    );
                    self.metrics.record_archive_failure();
                    failures.push(RunFailure::Prune {
                        destination: destination.to_string(),
                        archive: archive.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        if pruned == 0 {
            return false;
        }
        if self.options.dry_run {
            info!(destination = %destination, pruned, "[DRY RUN] Would compact repository");
            return true;
        }
        info!(destination = %destination, pruned, "Compacting repository");
        match self.backends.archives.compact(destination).await {
            Ok(()) => true,
            Err(e) => {
                warn!(destination = %destination, error = %e, "Failed to compact repository");
                self.metrics.record_archive_failure();
                failures.push(RunFailure::Compact {
                    destination: destination.to_string(),
                    error: e.to_string(),
                });
                false
            }
        }
    }
}
