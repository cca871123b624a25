use clap::Parser;
use std::path::PathBuf;

/// Command-line arguments of a snapkeep run.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "snapkeep",
    version,
    about = "Btrfs snapshots with tiered retention and borg archival"
)]
pub struct RunArgs {
    /// TOML configuration file
    pub config: PathBuf,

    #[arg(
        short = 'n',
        long,
        help = "Skip btrfs and borg commands that change anything; listings still run"
    )]
    pub dry_run: bool,

    #[arg(
        short,
        long = "skip-snapshot",
        help = "Do not make a new snapshot, only prune and archive existing ones"
    )]
    pub skip_snapshot: bool,

    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(short, long, help = "Only show warnings and errors")]
    pub quiet: bool,
}

/// Utility functions for CLI operations
pub mod utils {
    use super::*;
    use crate::config::Configuration;
    use anyhow::{Context, Result};
    use tracing_subscriber::EnvFilter;

    /// Log level implied by the verbosity flags.
    pub fn log_level(args: &RunArgs) -> &'static str {
        if args.quiet {
            "warn"
        } else if args.verbose {
            "debug"
        } else {
            "info"
        }
    }

    /// Initialize logging based on CLI arguments. `RUST_LOG` wins when set.
    pub fn init_logging(args: &RunArgs) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(log_level(args)));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }

    /// Load and validate the configuration document named on the command line.
    pub fn load_config(args: &RunArgs) -> Result<Configuration> {
        log::info!("Loading configuration from: {}", args.config.display());
        Configuration::load_from_path(&args.config).with_context(|| {
            format!(
                "Failed to load configuration from {}",
                args.config.display()
            )
        })
    }

    /// Standard version information
    pub fn version_info() -> String {
        format!(
            "{} {} ({})",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            env!("CARGO_PKG_RUST_VERSION")
        )
    }
}
