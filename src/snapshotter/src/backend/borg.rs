//! Borg archive primitives.
//!
//! Snapshots are archived from a fixed mount point,
//! `<root_mnt>/<snapshot prefix>current`, so borg sees the same absolute
//! paths on every run and its files cache stays valid.

use super::command::CommandLine;
use super::{ArchiveBackend, ArchiveRequest, BackendError};
use async_trait::async_trait;
use common::{ArchiveConfig, SnapshotConfig};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Time for the kernel to release the mount before unmounting.
const UNMOUNT_DELAY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct BorgBackend {
    env: BTreeMap<String, String>,
    mount_dir: PathBuf,
}

impl BorgBackend {
    pub fn new(snapshot: &SnapshotConfig, archive: &ArchiveConfig) -> Self {
        Self {
            env: archive.env.clone(),
            mount_dir: snapshot
                .root_mnt
                .join(format!("{}current", snapshot.prefix)),
        }
    }

    pub fn mount_dir(&self) -> &PathBuf {
        &self.mount_dir
    }

    fn borg(&self) -> CommandLine {
        CommandLine::new("borg").envs(&self.env)
    }

    /// `borg create` invocation for `request`, run inside the mount point.
    pub fn create_command(&self, request: &ArchiveRequest<'_>) -> CommandLine {
        self.borg()
            .args(["create", "--verbose", "--stats", "--show-rc", "--timestamp"])
            .arg(request.timestamp.format("%Y-%m-%dT%H:%M:%S").to_string())
            .args(request.extra)
            .arg(format!("{}::{}", request.repository, request.archive))
            .args(request.paths)
            .current_dir(&self.mount_dir)
    }

    async fn mount(&self, request: &ArchiveRequest<'_>) -> Result<(), BackendError> {
        if tokio::fs::metadata(&self.mount_dir)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false)
        {
            // Left over from an interrupted run; usually not mounted.
            if let Err(e) = CommandLine::new("umount").arg(&self.mount_dir).run().await {
                info!(error = %e, "Stale mount point was not mounted");
            }
        } else {
            info!(path = %self.mount_dir.display(), "Creating mount point");
            tokio::fs::create_dir_all(&self.mount_dir)
                .await
                .map_err(|source| BackendError::Io {
                    path: self.mount_dir.clone(),
                    source,
                })?;
        }

        CommandLine::new("mount")
            .arg(request.device)
            .arg(&self.mount_dir)
            .arg("-o")
            .arg(format!("subvol={},noatime", request.snapshot))
            .run()
            .await
    }

    async fn archive_mounted(&self, request: &ArchiveRequest<'_>) -> Result<(), BackendError> {
        for path in request.paths {
            let full_path = self.mount_dir.join(path);
            if !tokio::fs::try_exists(&full_path).await.unwrap_or(false) {
                return Err(BackendError::MissingArchivePath(full_path));
            }
        }
        self.create_command(request).run().await
    }

    async fn unmount(&self) -> Result<(), BackendError> {
        tokio::time::sleep(UNMOUNT_DELAY).await;
        CommandLine::new("umount").arg(&self.mount_dir).run().await?;
        info!(path = %self.mount_dir.display(), "Removing mount point");
        tokio::fs::remove_dir(&self.mount_dir)
            .await
            .map_err(|source| BackendError::Io {
                path: self.mount_dir.clone(),
                source,
            })
    }
}

#[async_trait]
impl ArchiveBackend for BorgBackend {
    async fn list_archives(&self, repository: &str) -> Result<String, BackendError> {
        self.borg().arg("list").arg(repository).output().await
    }

    async fn create_archive(&self, request: &ArchiveRequest<'_>) -> Result<(), BackendError> {
        self.mount(request).await?;
        let archived = self.archive_mounted(request).await;
        let unmounted = self.unmount().await;
        if let Err(e) = &unmounted {
            warn!(path = %self.mount_dir.display(), error = %e, "Failed to clean up mount point");
        }
        archived.and(unmounted)
    }

    async fn delete_archive(&self, repository: &str, archive: &str) -> Result<(), BackendError> {
        self.borg()
            .arg("delete")
            .arg(format!("{repository}::{archive}"))
            .run()
            .await
    }

    async fn compact(&self, repository: &str) -> Result<(), BackendError> {
        self.borg().arg("compact").arg(repository).run().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_create_command() {
        let snapshot = SnapshotConfig {
            source_path: PathBuf::from("/home"),
            prefix: "snapshots/home.".to_string(),
            root_mnt: PathBuf::from("/mnt"),
            ..Default::default()
        };
        let archive = ArchiveConfig {
            prefix: "home.".to_string(),
            env: BTreeMap::from([("BORG_RSH".to_string(), "ssh -i key".to_string())]),
            ..Default::default()
        };
        let backend = BorgBackend::new(&snapshot, &archive);
        assert_eq!(
            backend.mount_dir(),
            &PathBuf::from("/mnt/snapshots/home.current")
        );

        let paths = [PathBuf::from("alice"), PathBuf::from("bob")];
        let extra = ["--compression".to_string(), "zstd".to_string()];
        let request = ArchiveRequest {
            repository: "/mnt/bigdisk",
            archive: "home.2025_02_18__03_00_42",
            snapshot: "snapshots/home.2025_02_18__03_00_42",
            timestamp: NaiveDate::from_ymd_opt(2025, 2, 18)
                .unwrap()
                .and_hms_opt(3, 0, 42)
                .unwrap(),
            device: "/dev/sda3",
            paths: &paths,
            extra: &extra,
        };

        assert_eq!(
            backend.create_command(&request).display(),
            "borg create --verbose --stats --show-rc --timestamp 2025-02-18T03:00:42 \
             --compression zstd /mnt/bigdisk::home.2025_02_18__03_00_42 alice bob  \
             # in /mnt/snapshots/home.current"
        );
    }
}
