//! External primitives the orchestrator drives: btrfs snapshots, borg
//! archives and user hooks.
//!
//! Each primitive is a trait so the run state machine can be exercised
//! against an in-memory fake (see `testing`).

pub mod borg;
pub mod btrfs;
pub mod command;
pub mod hooks;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use common::Configuration;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use thiserror::Error;

pub use borg::BorgBackend;
pub use btrfs::BtrfsBackend;
pub use command::CommandLine;
pub use hooks::ShellHooks;

/// Device and subvolume backing a mounted btrfs path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSource {
    pub device: String,
    pub subvolume: String,
}

/// Local snapshot primitives.
#[async_trait]
pub trait SnapshotBackend: Send + Sync {
    /// Find the btrfs device and subvolume mounted at `source_path`.
    async fn locate_source(&self, source_path: &Path) -> Result<MountSource, BackendError>;

    /// Raw subvolume listing of the filesystem holding `source_path`.
    async fn list_subvolumes(&self, source_path: &Path) -> Result<String, BackendError>;

    /// Create a read-only snapshot of `source_path` at `target`.
    async fn create_snapshot(&self, source_path: &Path, target: &Path)
    -> Result<(), BackendError>;

    async fn delete_subvolume(&self, path: &Path) -> Result<(), BackendError>;
}

/// Everything needed to push one snapshot to one destination.
#[derive(Debug, Clone, Copy)]
pub struct ArchiveRequest<'a> {
    pub repository: &'a str,
    /// Archive name: destination prefix + formatted timestamp.
    pub archive: &'a str,
    /// Snapshot subvolume, relative to the btrfs top level.
    pub snapshot: &'a str,
    pub timestamp: NaiveDateTime,
    /// Device holding the snapshot.
    pub device: &'a str,
    /// Paths to archive, relative to the snapshot root.
    pub paths: &'a [PathBuf],
    pub extra: &'a [String],
}

/// Archival destination primitives.
#[async_trait]
pub trait ArchiveBackend: Send + Sync {
    /// Raw archive listing of `repository`.
    async fn list_archives(&self, repository: &str) -> Result<String, BackendError>;

    async fn create_archive(&self, request: &ArchiveRequest<'_>) -> Result<(), BackendError>;

    async fn delete_archive(&self, repository: &str, archive: &str) -> Result<(), BackendError>;

    /// Reclaim space after archives were deleted.
    async fn compact(&self, repository: &str) -> Result<(), BackendError>;
}

/// User-supplied pre/post snapshot commands.
#[async_trait]
pub trait HookRunner: Send + Sync {
    async fn run_hook(&self, command: &str) -> Result<(), BackendError>;
}

/// The set of primitives one run uses.
#[derive(Clone)]
pub struct Backends {
    pub snapshots: Arc<dyn SnapshotBackend>,
    pub archives: Arc<dyn ArchiveBackend>,
    pub hooks: Arc<dyn HookRunner>,
}

impl Backends {
    /// Real btrfs, borg and shell primitives for `config`.
    pub fn system(config: &Configuration) -> Self {
        Self {
            snapshots: Arc::new(BtrfsBackend::new(config.btrfs.sudo)),
            archives: Arc::new(BorgBackend::new(&config.btrfs, &config.borg)),
            hooks: Arc::new(ShellHooks),
        }
    }
}

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("`{command}` failed with {status}")]
    Failed { command: String, status: ExitStatus },

    #[error("Could not find '{0}' in PATH")]
    ProgramNotFound(String),

    #[error("{} is not on a mounted btrfs volume", .0.display())]
    SourceNotMounted(PathBuf),

    #[error("Mount options of {mount_point} have no subvol= entry: {options}")]
    MissingSubvolume {
        mount_point: String,
        options: String,
    },

    #[error("Path does not exist in snapshot: {}", .0.display())]
    MissingArchivePath(PathBuf),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}
