//! External command execution.

use super::BackendError;
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};

/// A fully described external command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    program: OsString,
    args: Vec<OsString>,
    env: BTreeMap<String, String>,
    cwd: Option<PathBuf>,
}

impl CommandLine {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    /// `program`, prefixed with `sudo` when `privileged`.
    pub fn privileged(program: impl AsRef<OsStr>, privileged: bool) -> Self {
        if privileged {
            Self::new("sudo").arg(program)
        } else {
            Self::new(program)
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn envs(mut self, env: &BTreeMap<String, String>) -> Self {
        self.env
            .extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Shell-like rendering for logs.
    pub fn display(&self) -> String {
        let mut rendered = self.program.to_string_lossy().into_owned();
        for arg in &self.args {
            rendered.push(' ');
            rendered.push_str(&arg.to_string_lossy());
        }
        if let Some(cwd) = &self.cwd {
            rendered.push_str("  # in ");
            rendered.push_str(&cwd.to_string_lossy());
        }
        rendered
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }
        command
    }

    /// Run with inherited stdout and stderr.
    pub async fn run(&self) -> Result<(), BackendError> {
        let rendered = self.display();
        info!(command = %rendered, "Running");
        let status = self
            .command()
            .status()
            .await
            .map_err(|source| BackendError::Spawn {
                command: rendered.clone(),
                source,
            })?;
        if status.success() {
            Ok(())
        } else {
            Err(BackendError::Failed {
                command: rendered,
                status,
            })
        }
    }

    /// Run and capture stdout.
    pub async fn output(&self) -> Result<String, BackendError> {
        let rendered = self.display();
        info!(command = %rendered, "Running");
        let output = self
            .command()
            .output()
            .await
            .map_err(|source| BackendError::Spawn {
                command: rendered.clone(),
                source,
            })?;
        if !output.status.success() {
            warn!(
                command = %rendered,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "Command failed"
            );
            return Err(BackendError::Failed {
                command: rendered,
                status: output.status,
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Resolve `program` against `PATH`.
///
/// Privileged commands get an absolute path so `sudo` does not depend on the
/// caller's `PATH`.
pub fn find_program(program: &str) -> Result<PathBuf, BackendError> {
    let path = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&path)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| BackendError::ProgramNotFound(program.to_string()))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let command = CommandLine::privileged("/usr/bin/btrfs", true)
            .args(["subvolume", "delete"])
            .arg("/mnt/snapshots/home.2025_02_17__03_00_48");
        assert_eq!(
            command.display(),
            "sudo /usr/bin/btrfs subvolume delete /mnt/snapshots/home.2025_02_17__03_00_48"
        );

        let command = CommandLine::new("borg")
            .args(["create", "repo::home.x", "alice"])
            .current_dir("/mnt/snapshots/home.current");
        assert_eq!(
            command.display(),
            "borg create repo::home.x alice  # in /mnt/snapshots/home.current"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_reports_exit_status() {
        assert!(CommandLine::new("sh").args(["-c", "exit 0"]).run().await.is_ok());

        let result = CommandLine::new("sh").args(["-c", "exit 3"]).run().await;
        assert!(matches!(result, Err(BackendError::Failed { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_output_captures_stdout_with_env() {
        let env = BTreeMap::from([("SNAPKEEP_TEST_VALUE".to_string(), "42".to_string())]);
        let output = CommandLine::new("sh")
            .args(["-c", "echo $SNAPKEEP_TEST_VALUE"])
            .envs(&env)
            .output()
            .await
            .unwrap();
        assert_eq!(output.trim(), "42");
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let result = CommandLine::new("/nonexistent/snapkeep-tool").run().await;
        assert!(matches!(result, Err(BackendError::Spawn { .. })));
    }

    #[test]
    fn test_find_missing_program() {
        assert!(matches!(
            find_program("snapkeep-no-such-program"),
            Err(BackendError::ProgramNotFound(_))
        ));
    }
}
