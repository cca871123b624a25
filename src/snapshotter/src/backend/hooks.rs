use super::command::CommandLine;
use super::{BackendError, HookRunner};
use async_trait::async_trait;

/// Runs hooks through `sh -c`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellHooks;

#[async_trait]
impl HookRunner for ShellHooks {
    async fn run_hook(&self, command: &str) -> Result<(), BackendError> {
        CommandLine::new("sh").arg("-c").arg(command).run().await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_hook_exit_status() {
        assert!(ShellHooks.run_hook("true").await.is_ok());
        assert!(matches!(
            ShellHooks.run_hook("exit 2").await,
            Err(BackendError::Failed { .. })
        ));
    }
}
