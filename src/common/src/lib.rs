//! Shared building blocks for snapkeep: the configuration document, the
//! timestamp format used in snapshot and archive names, and CLI helpers.

pub mod cli;
pub mod config;
pub mod timestamp;

pub use config::{ArchiveConfig, ConfigError, Configuration, KeepConfig, SnapshotConfig};
pub use timestamp::{TimestampError, TimestampFormat};
