//! snapkeep
//!
//! Takes a btrfs snapshot, prunes snapshots no retention rule keeps any more
//! and archives the kept ones to borg repositories. Meant to be run from a
//! timer, one run per invocation.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use common::cli::{RunArgs, utils};
use snapshotter::{Backends, RunMetrics, RunOptions, RunOrchestrator, RunPhase};

/// Exit status of a run that aborted.
const EXIT_FATAL: u8 = 1;

/// Waits for a shutdown signal (SIGINT or SIGTERM)
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigint =
            signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

        tokio::select! {
            _ = sigint.recv() => log::warn!("Received SIGINT"),
            _ = sigterm.recv() => log::warn!("Received SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for shutdown signal")?;
        log::warn!("Received Ctrl+C");
    }

    Ok(())
}

async fn run(args: &RunArgs) -> Result<u8> {
    let config = utils::load_config(args)?;
    let options = RunOptions {
        dry_run: args.dry_run,
        skip_creation: args.skip_snapshot,
    };
    let orchestrator = RunOrchestrator::new(
        &config,
        options,
        Backends::system(&config),
        RunMetrics::new(),
    )
    .context("Failed to prepare run")?;

    tokio::select! {
        report = orchestrator.run() => Ok(report?.exit_code()),
        signal = wait_for_shutdown_signal() => {
            signal?;
            // Dropping the run future kills the running child process.
            tracing::error!(phase = %RunPhase::Failed, "Run interrupted");
            Ok(EXIT_FATAL)
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let args = RunArgs::parse();
    utils::init_logging(&args);
    tracing::debug!(version = %utils::version_info(), "Starting");

    match run(&args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!("{e:#}");
            ExitCode::from(EXIT_FATAL)
        }
    }
}
