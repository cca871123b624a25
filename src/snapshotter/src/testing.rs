//! In-memory fake of the snapshot, archive and hook primitives.
//!
//! `RecordingBackend` keeps subvolumes and repositories in memory, records
//! every call in order and fails on demand, so the orchestrator can be driven
//! through its whole state machine without btrfs or borg.

use crate::backend::{
    ArchiveBackend, ArchiveRequest, BackendError, Backends, HookRunner, MountSource,
    SnapshotBackend,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A primitive invocation seen by the fake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    LocateSource(PathBuf),
    ListSubvolumes(PathBuf),
    CreateSnapshot { source: PathBuf, target: PathBuf },
    DeleteSubvolume(PathBuf),
    ListArchives(String),
    CreateArchive {
        repository: String,
        archive: String,
        snapshot: String,
    },
    DeleteArchive { repository: String, archive: String },
    Compact(String),
    Hook(String),
}

impl Call {
    /// Whether the call changes state on disk or runs user code.
    pub fn is_mutating(&self) -> bool {
        !matches!(
            self,
            Call::LocateSource(_) | Call::ListSubvolumes(_) | Call::ListArchives(_)
        )
    }
}

#[derive(Debug, Default)]
struct Injected {
    unmounted: bool,
    snapshot_listing: bool,
    snapshot_creation: bool,
    hooks: BTreeSet<String>,
    deletions: BTreeSet<String>,
    unreachable: BTreeSet<String>,
    archive_pushes: BTreeSet<String>,
    archive_deletions: BTreeSet<String>,
    compactions: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct State {
    subvolumes: BTreeSet<String>,
    repositories: BTreeMap<String, BTreeSet<String>>,
    calls: Vec<Call>,
    fail: Injected,
}

/// Recording fake implementing every backend trait.
#[derive(Debug, Clone)]
pub struct RecordingBackend {
    root_mnt: PathBuf,
    mount: MountSource,
    state: Arc<Mutex<State>>,
}

fn injected(operation: &str, target: &str) -> BackendError {
    BackendError::Spawn {
        command: format!("{operation} {target}"),
        source: std::io::Error::other("injected failure"),
    }
}

impl RecordingBackend {
    /// A fake whose snapshots live under `root_mnt`.
    pub fn new(root_mnt: impl Into<PathBuf>) -> Self {
        Self {
            root_mnt: root_mnt.into(),
            mount: MountSource {
                device: "/dev/fake0".to_string(),
                subvolume: "/".to_string(),
            },
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed existing snapshot subvolumes, named relative to the top level.
    pub fn with_snapshots<I, S>(self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock()
            .subvolumes
            .extend(names.into_iter().map(Into::into));
        self
    }

    /// Seed a repository with existing archives.
    pub fn with_repository<I, S>(self, repository: &str, archives: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.lock()
            .repositories
            .entry(repository.to_string())
            .or_default()
            .extend(archives.into_iter().map(Into::into));
        self
    }

    pub fn unmounted(self) -> Self {
        self.lock().fail.unmounted = true;
        self
    }

    pub fn fail_snapshot_listing(self) -> Self {
        self.lock().fail.snapshot_listing = true;
        self
    }

    pub fn fail_snapshot_creation(self) -> Self {
        self.lock().fail.snapshot_creation = true;
        self
    }

    pub fn fail_hook(self, command: &str) -> Self {
        self.lock().fail.hooks.insert(command.to_string());
        self
    }

    pub fn fail_deletion(self, name: &str) -> Self {
        self.lock().fail.deletions.insert(name.to_string());
        self
    }

    /// Make listing `repository` fail.
    pub fn unreachable(self, repository: &str) -> Self {
        self.lock().fail.unreachable.insert(repository.to_string());
        self
    }

    /// Make every push to `repository` fail.
    pub fn fail_archive_pushes(self, repository: &str) -> Self {
        self.lock()
            .fail
            .archive_pushes
            .insert(repository.to_string());
        self
    }

    pub fn fail_archive_deletions(self, repository: &str) -> Self {
        self.lock()
            .fail
            .archive_deletions
            .insert(repository.to_string());
        self
    }

    pub fn fail_compaction(self, repository: &str) -> Self {
        self.lock().fail.compactions.insert(repository.to_string());
        self
    }

    /// Clear all injected failures, e.g. to simulate a healed destination.
    pub fn heal(&self) {
        self.lock().fail = Injected::default();
    }

    /// Backends sharing this fake's state.
    pub fn backends(&self) -> Backends {
        Backends {
            snapshots: Arc::new(self.clone()),
            archives: Arc::new(self.clone()),
            hooks: Arc::new(self.clone()),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    pub fn mutating_calls(&self) -> Vec<Call> {
        self.lock()
            .calls
            .iter()
            .filter(|call| call.is_mutating())
            .cloned()
            .collect()
    }

    pub fn subvolumes(&self) -> BTreeSet<String> {
        self.lock().subvolumes.clone()
    }

    pub fn archives(&self, repository: &str) -> BTreeSet<String> {
        self.lock()
            .repositories
            .get(repository)
            .cloned()
            .unwrap_or_default()
    }

    pub fn hooks_run(&self) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                Call::Hook(command) => Some(command.clone()),
                _ => None,
            })
            .collect()
    }

    fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root_mnt)
            .unwrap_or(path)
            .to_string_lossy()
            .into_owned()
    }
}

#[async_trait]
impl SnapshotBackend for RecordingBackend {
    async fn locate_source(&self, source_path: &Path) -> Result<MountSource, BackendError> {
        let mut state = self.lock();
        state.calls.push(Call::LocateSource(source_path.to_path_buf()));
        if state.fail.unmounted {
            return Err(BackendError::SourceNotMounted(source_path.to_path_buf()));
        }
        Ok(self.mount.clone())
    }

    async fn list_subvolumes(&self, source_path: &Path) -> Result<String, BackendError> {
        let mut state = self.lock();
        state
            .calls
            .push(Call::ListSubvolumes(source_path.to_path_buf()));
        if state.fail.snapshot_listing {
            return Err(injected("list", &source_path.to_string_lossy()));
        }

        let mut output = String::from("ID 256 gen 100 top level 5 path home\n");
        for (id, name) in (257..).zip(&state.subvolumes) {
            output.push_str(&format!("ID {id} gen 100 top level 5 path {name}\n"));
        }
        Ok(output)
    }

    async fn create_snapshot(
        &self,
        source_path: &Path,
        target: &Path,
    ) -> Result<(), BackendError> {
        let name = self.relative(target);
        let mut state = self.lock();
        state.calls.push(Call::CreateSnapshot {
            source: source_path.to_path_buf(),
            target: target.to_path_buf(),
        });
        if state.fail.snapshot_creation || state.subvolumes.contains(&name) {
            return Err(injected("snapshot", &name));
        }
        state.subvolumes.insert(name);
        Ok(())
    }

    async fn delete_subvolume(&self, path: &Path) -> Result<(), BackendError> {
        let name = self.relative(path);
        let mut state = self.lock();
        state.calls.push(Call::DeleteSubvolume(path.to_path_buf()));
        if state.fail.deletions.contains(&name) || !state.subvolumes.remove(&name) {
            return Err(injected("delete", &name));
        }
        Ok(())
    }
}

#[async_trait]
impl ArchiveBackend for RecordingBackend {
    async fn list_archives(&self, repository: &str) -> Result<String, BackendError> {
        let mut state = self.lock();
        state.calls.push(Call::ListArchives(repository.to_string()));
        if state.fail.unreachable.contains(repository) {
            return Err(injected("list", repository));
        }
        Ok(state
            .repositories
            .get(repository)
            .into_iter()
            .flatten()
            .map(|archive| format!("{archive}    Mon, 2025-01-06 03:00:00 [0000]\n"))
            .collect())
    }

    async fn create_archive(&self, request: &ArchiveRequest<'_>) -> Result<(), BackendError> {
        let mut state = self.lock();
        state.calls.push(Call::CreateArchive {
            repository: request.repository.to_string(),
            archive: request.archive.to_string(),
            snapshot: request.snapshot.to_string(),
        });
        if state.fail.archive_pushes.contains(request.repository)
            || !state.subvolumes.contains(request.snapshot)
        {
            return Err(injected("create", request.archive));
        }
        state
            .repositories
            .entry(request.repository.to_string())
            .or_default()
            .insert(request.archive.to_string());
        Ok(())
    }

    async fn delete_archive(&self, repository: &str, archive: &str) -> Result<(), BackendError> {
        let mut state = self.lock();
        state.calls.push(Call::DeleteArchive {
            repository: repository.to_string(),
            archive: archive.to_string(),
        });
        if state.fail.archive_deletions.contains(repository) {
            return Err(injected("delete", archive));
        }
        if let Some(archives) = state.repositories.get_mut(repository) {
            archives.remove(archive);
        }
        Ok(())
    }

    async fn compact(&self, repository: &str) -> Result<(), BackendError> {
        let mut state = self.lock();
        state.calls.push(Call::Compact(repository.to_string()));
        if state.fail.compactions.contains(repository) {
            return Err(injected("compact", repository));
        }
        Ok(())
    }
}

#[async_trait]
impl HookRunner for RecordingBackend {
    async fn run_hook(&self, command: &str) -> Result<(), BackendError> {
        let mut state = self.lock();
        state.calls.push(Call::Hook(command.to_string()));
        if state.fail.hooks.contains(command) {
            return Err(injected("hook", command));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_lifecycle() {
        let fake = RecordingBackend::new("/mnt").with_snapshots(["snapshots/home.a"]);

        fake.create_snapshot(Path::new("/home"), Path::new("/mnt/snapshots/home.b"))
            .await
            .unwrap();
        let listing = fake.list_subvolumes(Path::new("/home")).await.unwrap();
        assert!(listing.contains("path snapshots/home.a\n"));
        assert!(listing.contains("path snapshots/home.b\n"));

        fake.delete_subvolume(Path::new("/mnt/snapshots/home.a"))
            .await
            .unwrap();
        assert_eq!(
            fake.subvolumes(),
            BTreeSet::from(["snapshots/home.b".to_string()])
        );
        assert_eq!(fake.mutating_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let fake = RecordingBackend::new("/mnt")
            .unreachable("offsite")
            .fail_hook("false");

        assert!(fake.list_archives("offsite").await.is_err());
        assert_eq!(fake.list_archives("local").await.unwrap(), "");
        assert!(fake.run_hook("false").await.is_err());

        fake.heal();
        assert!(fake.list_archives("offsite").await.is_ok());
        assert!(fake.run_hook("false").await.is_ok());
        assert_eq!(fake.hooks_run(), vec!["false", "false"]);
    }
}
