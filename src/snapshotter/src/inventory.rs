//! Inventory adapter: turns tool listings into timestamped entities.
//!
//! Entities are named `<prefix><timestamp>`. Listings are parsed leniently:
//! anything that does not carry the prefix belongs to someone else and is
//! skipped, while names that carry the prefix but no parsable timestamp are
//! skipped with a warning.

use crate::backend::{ArchiveBackend, BackendError, MountSource, SnapshotBackend};
use crate::retention::TimestampSet;
use chrono::NaiveDateTime;
use common::TimestampFormat;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Entity names keyed by the timestamp they encode.
pub type NamedEntities = BTreeMap<NaiveDateTime, String>;

/// Timestamps of `entities`.
pub fn timestamps(entities: &NamedEntities) -> TimestampSet {
    entities.keys().copied().collect()
}

/// Find the btrfs device and subvolume backing `path` in a mount table.
///
/// The longest btrfs mount point containing `path` wins.
pub fn find_source(mounts: &str, path: &Path) -> Result<MountSource, BackendError> {
    let best = mounts
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>())
        .filter(|fields| fields.len() >= 4 && fields[2] == "btrfs")
        .filter(|fields| path.starts_with(fields[1]))
        .max_by_key(|fields| fields[1].len())
        .ok_or_else(|| BackendError::SourceNotMounted(path.to_path_buf()))?;

    let subvolume = best[3]
        .split(',')
        .find_map(|option| option.strip_prefix("subvol="))
        .ok_or_else(|| BackendError::MissingSubvolume {
            mount_point: best[1].to_string(),
            options: best[3].to_string(),
        })?;

    Ok(MountSource {
        device: best[0].to_string(),
        subvolume: subvolume.to_string(),
    })
}

fn parse_names<'a>(
    names: impl Iterator<Item = &'a str>,
    prefix: &str,
    format: &TimestampFormat,
) -> NamedEntities {
    let mut entities = NamedEntities::new();
    for name in names {
        if !name.starts_with(prefix) {
            continue;
        }
        match format.parse_suffix(name, prefix) {
            Ok(timestamp) => {
                entities.insert(timestamp, name.to_string());
            }
            Err(e) => warn!(name = %name, error = %e, "Ignoring entity with unparsable timestamp"),
        }
    }
    entities
}

/// Parse `btrfs subvolume list` output: the path is the last word of a line.
pub fn parse_subvolume_list(output: &str, prefix: &str, format: &TimestampFormat) -> NamedEntities {
    parse_names(
        output.lines().filter_map(|line| line.split_whitespace().last()),
        prefix,
        format,
    )
}

/// Parse `borg list` output: the archive name is the first word of a line.
pub fn parse_archive_list(output: &str, prefix: &str, format: &TimestampFormat) -> NamedEntities {
    parse_names(
        output.lines().filter_map(|line| line.split_whitespace().next()),
        prefix,
        format,
    )
}

/// Lists snapshots and archives through the backends.
#[derive(Clone)]
pub struct InventoryAdapter {
    snapshots: Arc<dyn SnapshotBackend>,
    archives: Arc<dyn ArchiveBackend>,
    format: TimestampFormat,
    snapshot_prefix: String,
    archive_prefix: String,
}

impl InventoryAdapter {
    pub fn new(
        snapshots: Arc<dyn SnapshotBackend>,
        archives: Arc<dyn ArchiveBackend>,
        format: TimestampFormat,
        snapshot_prefix: impl Into<String>,
        archive_prefix: impl Into<String>,
    ) -> Self {
        Self {
            snapshots,
            archives,
            format,
            snapshot_prefix: snapshot_prefix.into(),
            archive_prefix: archive_prefix.into(),
        }
    }

    pub fn format(&self) -> &TimestampFormat {
        &self.format
    }

    pub fn snapshot_name(&self, timestamp: NaiveDateTime) -> String {
        self.format.name(&self.snapshot_prefix, timestamp)
    }

    pub fn archive_name(&self, timestamp: NaiveDateTime) -> String {
        self.format.name(&self.archive_prefix, timestamp)
    }

    /// Existing snapshots of the volume holding `source_path`.
    pub async fn list_snapshots(&self, source_path: &Path) -> Result<NamedEntities, BackendError> {
        info!(source = %source_path.display(), "Listing snapshots");
        let output = self.snapshots.list_subvolumes(source_path).await?;
        let snapshots = parse_subvolume_list(&output, &self.snapshot_prefix, &self.format);
        debug!(count = snapshots.len(), "Found snapshots");
        Ok(snapshots)
    }

    /// Existing archives in `repository`.
    pub async fn list_archives(&self, repository: &str) -> Result<NamedEntities, BackendError> {
        info!(destination = %repository, "Listing archives");
        let output = self.archives.list_archives(repository).await?;
        let archives = parse_archive_list(&output, &self.archive_prefix, &self.format);
        debug!(destination = %repository, count = archives.len(), "Found archives");
        Ok(archives)
    }
}
