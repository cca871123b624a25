//! Btrfs snapshot primitives backed by the `btrfs` command.

use super::command::{CommandLine, find_program};
use super::{BackendError, MountSource, SnapshotBackend};
use crate::inventory::find_source;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

pub const MOUNT_TABLE: &str = "/proc/mounts";

#[derive(Debug, Clone)]
pub struct BtrfsBackend {
    sudo: bool,
    mount_table: PathBuf,
}

impl BtrfsBackend {
    pub fn new(sudo: bool) -> Self {
        Self {
            sudo,
            mount_table: PathBuf::from(MOUNT_TABLE),
        }
    }

    /// Read mounts from `path` instead of `/proc/mounts`.
    pub fn with_mount_table(mut self, path: impl Into<PathBuf>) -> Self {
        self.mount_table = path.into();
        self
    }

    fn subvolume(&self, action: &str) -> Result<CommandLine, BackendError> {
        let btrfs = find_program("btrfs")?;
        Ok(CommandLine::privileged(btrfs, self.sudo).args(["subvolume", action]))
    }
}

#[async_trait]
impl SnapshotBackend for BtrfsBackend {
    async fn locate_source(&self, source_path: &Path) -> Result<MountSource, BackendError> {
        let mounts = tokio::fs::read_to_string(&self.mount_table)
            .await
            .map_err(|source| BackendError::Io {
                path: self.mount_table.clone(),
                source,
            })?;
        find_source(&mounts, source_path)
    }

    async fn list_subvolumes(&self, source_path: &Path) -> Result<String, BackendError> {
        self.subvolume("list")?.arg(source_path).output().await
    }

    async fn create_snapshot(
        &self,
        source_path: &Path,
        target: &Path,
    ) -> Result<(), BackendError> {
        self.subvolume("snapshot")?
            .arg("-r")
            .arg(source_path)
            .arg(target)
            .run()
            .await
    }

    async fn delete_subvolume(&self, path: &Path) -> Result<(), BackendError> {
        self.subvolume("delete")?.arg(path).run().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_locate_source_from_mount_table() {
        let mut table = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            table,
            "/dev/sda3 /home btrfs rw,noatime,subvolid=256,subvol=/home 0 0"
        )
        .unwrap();

        let backend = BtrfsBackend::new(false).with_mount_table(table.path());
        let source = backend
            .locate_source(Path::new("/home/alice"))
            .await
            .unwrap();
        assert_eq!(source.device, "/dev/sda3");
        assert_eq!(source.subvolume, "/home");

        let missing = backend.locate_source(Path::new("/srv")).await;
        assert!(matches!(missing, Err(BackendError::SourceNotMounted(_))));
    }

    #[tokio::test]
    async fn test_unreadable_mount_table() {
        let backend = BtrfsBackend::new(false).with_mount_table("/nonexistent/mounts");
        let result = backend.locate_source(Path::new("/")).await;
        assert!(matches!(result, Err(BackendError::Io { .. })));
    }
}
