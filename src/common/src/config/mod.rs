use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

use crate::timestamp::{DEFAULT_DATETIME_FORMAT, TimestampError, TimestampFormat};

/// Prefix of environment variables overriding the configuration document,
/// e.g. `SNAPKEEP__BORG__PREFIX`.
pub const ENV_PREFIX: &str = "SNAPKEEP__";

/// One retention tier: keep the oldest snapshot of each of the `amount` most
/// recent bins of width `interval`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepConfig {
    /// Bin width, e.g. `"hour"`, `"10 minutes"`, `"7 days"`.
    #[serde(with = "interval")]
    pub interval: Duration,

    /// Number of most recent bins in which a snapshot is kept.
    pub amount: u32,

    /// Whether matched snapshots are also archived with borg.
    #[serde(default)]
    pub backup: bool,
}

/// Btrfs snapshot source.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Mounted btrfs volume to snapshot.
    #[serde(default)]
    pub source_path: PathBuf,

    /// Prefix of snapshot subvolume names; the timestamp is appended.
    #[serde(default)]
    pub prefix: String,

    /// Mount point of the btrfs top level, under which snapshots live.
    #[serde(default, alias = "snapshot_mnt")]
    pub root_mnt: PathBuf,

    /// Shell commands run before a snapshot is taken.
    #[serde(default)]
    pub pre: Vec<String>,

    /// Shell commands run after a snapshot is taken.
    #[serde(default)]
    pub post: Vec<String>,

    /// Run btrfs commands through sudo.
    #[serde(default = "default_true")]
    pub sudo: bool,

    /// Do not create a snapshot no retention rule would keep.
    #[serde(default)]
    pub skip_redundant: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            source_path: PathBuf::new(),
            prefix: String::new(),
            root_mnt: PathBuf::new(),
            pre: Vec::new(),
            post: Vec::new(),
            sudo: true,
            skip_redundant: false,
        }
    }
}

/// Borg archival destinations. No repositories means no archival.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Prefix of archive names; the timestamp is appended.
    #[serde(default = "default_archive_prefix")]
    pub prefix: String,

    /// Environment variables set for every borg command.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Borg repositories to archive to.
    #[serde(default)]
    pub repositories: Vec<String>,

    /// Paths inside the snapshot to archive, relative to its root.
    #[serde(default)]
    pub paths: Vec<PathBuf>,

    /// Extra arguments for `borg create`.
    #[serde(default)]
    pub extra: Vec<String>,

    /// Delete archives no archive rule selects any more.
    #[serde(default = "default_true")]
    pub prune: bool,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            prefix: default_archive_prefix(),
            env: BTreeMap::new(),
            repositories: Vec::new(),
            paths: Vec::new(),
            extra: Vec::new(),
            prune: true,
        }
    }
}

impl ArchiveConfig {
    pub fn is_enabled(&self) -> bool {
        !self.repositories.is_empty()
    }
}

fn default_true() -> bool {
    true
}

fn default_archive_prefix() -> String {
    "backup.".to_string()
}

fn default_datetime_format() -> String {
    DEFAULT_DATETIME_FORMAT.to_string()
}

/// Origin used when the document does not set `time_origin`.
pub fn default_time_origin() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 1)
        .and_then(|date| date.and_hms_opt(3, 55, 0))
        .unwrap_or_default()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Configuration {
    /// Format of the timestamp suffix of snapshot and archive names.
    #[serde(default = "default_datetime_format")]
    pub datetime_format: String,

    /// Origin of the time axis, written in `datetime_format`.
    #[serde(default)]
    pub time_origin: Option<String>,

    /// Retention tiers.
    #[serde(default)]
    pub keeps: Vec<KeepConfig>,

    /// Snapshot source.
    #[serde(default)]
    pub btrfs: SnapshotConfig,

    /// Archival destinations.
    #[serde(default)]
    pub borg: ArchiveConfig,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            datetime_format: default_datetime_format(),
            time_origin: None,
            keeps: Vec::new(),
            btrfs: SnapshotConfig::default(),
            borg: ArchiveConfig::default(),
        }
    }
}

impl Configuration {
    /// Load a TOML document, apply `SNAPKEEP__*` overrides and validate.
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        if !path.is_file() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        Self::load(Toml::file(path))
    }

    /// Like [`Configuration::load_from_path`] for an in-memory document.
    pub fn load_from_str(document: &str) -> Result<Self, ConfigError> {
        Self::load(Toml::string(document))
    }

    fn load(document: figment::providers::Data<Toml>) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(Configuration::default()))
            .merge(document)
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Checks:
    /// - At least one retention rule, each with a positive interval and amount
    /// - The snapshot source is fully specified
    /// - The datetime format round-trips and the time origin parses with it
    /// - Archive settings are usable when repositories are configured
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keeps.is_empty() {
            return Err(ConfigError::NoRetentionRules);
        }
        for (index, keep) in self.keeps.iter().enumerate() {
            if keep.interval.is_zero() {
                return Err(ConfigError::ZeroInterval { index });
            }
            if keep.amount == 0 {
                return Err(ConfigError::ZeroAmount { index });
            }
        }

        if self.btrfs.source_path.as_os_str().is_empty() {
            return Err(ConfigError::MissingField("btrfs.source_path"));
        }
        if self.btrfs.prefix.is_empty() {
            return Err(ConfigError::MissingField("btrfs.prefix"));
        }
        if self.btrfs.root_mnt.as_os_str().is_empty() {
            return Err(ConfigError::MissingField("btrfs.root_mnt"));
        }

        self.time_origin()?;

        if self.borg.is_enabled() {
            if self.borg.prefix.is_empty() {
                return Err(ConfigError::MissingField("borg.prefix"));
            }
            if let Some(path) = self.borg.paths.iter().find(|p| p.is_absolute()) {
                return Err(ConfigError::AbsoluteArchivePath(path.clone()));
            }
        }

        Ok(())
    }

    pub fn timestamp_format(&self) -> Result<TimestampFormat, ConfigError> {
        Ok(TimestampFormat::new(self.datetime_format.as_str())?)
    }

    /// Parsed time origin, or the default one when unset.
    pub fn time_origin(&self) -> Result<NaiveDateTime, ConfigError> {
        let format = self.timestamp_format()?;
        match &self.time_origin {
            None => Ok(default_time_origin()),
            Some(value) => format
                .parse(value)
                .map_err(|source| ConfigError::InvalidTimeOrigin {
                    value: value.clone(),
                    source,
                }),
        }
    }

    /// Rules whose snapshots are also archived.
    pub fn archived_keeps(&self) -> impl Iterator<Item = &KeepConfig> {
        self.keeps.iter().filter(|keep| keep.backup)
    }
}

/// Errors raised while loading or validating the configuration document.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to load configuration: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("No retention rules configured, add at least one [[keeps]] table")]
    NoRetentionRules,

    #[error("Retention rule #{index} has a zero interval")]
    ZeroInterval { index: usize },

    #[error("Retention rule #{index} has a zero amount")]
    ZeroAmount { index: usize },

    #[error("Missing required setting '{0}'")]
    MissingField(&'static str),

    #[error("Archive path must be relative to the snapshot root: {}", .0.display())]
    AbsoluteArchivePath(PathBuf),

    #[error(transparent)]
    Timestamp(#[from] TimestampError),

    #[error("Invalid time_origin '{value}': {source}")]
    InvalidTimeOrigin {
        value: String,
        source: TimestampError,
    },
}

/// Serde adapter for retention intervals.
///
/// Accepts humantime durations (`"2h"`, `"7 days"`, `"10 minutes"`) and a
/// bare unit meaning one of it (`"hour"`, `"day"`, `"min"`).
pub mod interval {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn parse(value: &str) -> Result<Duration, humantime::DurationError> {
        let words: Vec<&str> = value.split_whitespace().collect();
        let normalized = match words.as_slice() {
            [unit] if unit.chars().all(char::is_alphabetic) => format!("1{unit}"),
            [number, unit] if number.chars().all(|c| c.is_ascii_digit()) => {
                format!("{number}{unit}")
            }
            _ => value.trim().to_string(),
        };
        humantime::parse_duration(&normalized)
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(|e| serde::de::Error::custom(format!("invalid interval '{raw}': {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE_CONFIG1: &str = r#"
datetime_format = '%Y_%m_%d__%H_%M'
time_origin = '2024_05_01__07_15'

[[keeps]]
interval = "10 minutes"
amount = 12

[[keeps]]
interval = "hour"
amount = 48

[[keeps]]
backup = true
interval = "day"
amount = 28

[[keeps]]
backup = true
interval = "7 days"
amount = 52

[btrfs]
source_path = "/home"
prefix = "snapshots/home."
snapshot_mnt = "/mnt"
pre = []
post = []

[borg]
prefix = "home."
env = {}
extra = []
paths = ["alice", "bob"]
repositories = ["/mnt/bigdisk", "offsite:/mnt/storage"]
"#;

    const EXAMPLE_CONFIG2: &str = r#"
[[keeps]]
interval = "hour"
amount = 48

[btrfs]
source_path = "/"
prefix = "snapshots/foo."
root_mnt = "/data"
"#;

    fn dt(y: i32, m: u32, d: u32, h: u32, min: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
    }

    #[test]
    fn test_convert_interval() {
        let minute = Duration::from_secs(60);
        let hour = Duration::from_secs(3600);
        let day = Duration::from_secs(86400);
        let cases = [
            ("min", minute),
            ("minute", minute),
            ("minutes", minute),
            ("10 min", minute * 10),
            ("20 minute", minute * 20),
            ("30 minutes", minute * 30),
            ("hour", hour),
            ("hours", hour),
            ("8 hour", hour * 8),
            ("10 hours", hour * 10),
            ("day", day),
            ("days", day),
            ("8 day", day * 8),
            ("10 days", day * 10),
            ("2h 30min", hour * 2 + minute * 30),
        ];
        for (input, expected) in cases {
            assert_eq!(interval::parse(input).unwrap(), expected, "input {input:?}");
        }
    }

    #[test]
    fn test_invalid_interval() {
        assert!(interval::parse("fortnight").is_err());
        assert!(interval::parse("1 2 3").is_err());
        assert!(interval::parse("").is_err());
    }

    #[test]
    fn test_load_config1() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("snapkeep.toml", EXAMPLE_CONFIG1)?;
            let config = Configuration::load_from_path(Path::new("snapkeep.toml")).unwrap();

            assert_eq!(config.datetime_format, "%Y_%m_%d__%H_%M");
            assert_eq!(config.time_origin().unwrap(), dt(2024, 5, 1, 7, 15));
            assert_eq!(config.btrfs.source_path, PathBuf::from("/home"));
            assert_eq!(config.btrfs.prefix, "snapshots/home.");
            assert_eq!(config.btrfs.root_mnt, PathBuf::from("/mnt"));
            assert!(config.btrfs.sudo);
            assert_eq!(config.borg.prefix, "home.");
            assert_eq!(
                config.borg.paths,
                vec![PathBuf::from("alice"), PathBuf::from("bob")]
            );
            assert_eq!(
                config.borg.repositories,
                vec!["/mnt/bigdisk", "offsite:/mnt/storage"]
            );
            assert_eq!(config.keeps.len(), 4);
            assert_eq!(config.keeps[0].interval, Duration::from_secs(600));
            assert_eq!(config.keeps[0].amount, 12);
            assert!(!config.keeps[0].backup);
            assert_eq!(config.keeps[3].interval, Duration::from_secs(7 * 86400));
            assert_eq!(config.keeps[3].amount, 52);
            assert!(config.keeps[3].backup);
            assert_eq!(config.archived_keeps().count(), 2);
            Ok(())
        });
    }

    #[test]
    fn test_load_config2_defaults() {
        // Inside a jail so overrides set by other tests are not visible.
        figment::Jail::expect_with(|_| {
            let config = Configuration::load_from_str(EXAMPLE_CONFIG2).unwrap();

            assert_eq!(config.datetime_format, "%Y_%m_%d__%H_%M_%S");
            assert_eq!(config.time_origin().unwrap(), dt(2024, 1, 1, 3, 55));
            assert_eq!(config.btrfs.root_mnt, PathBuf::from("/data"));
            assert_eq!(config.borg.prefix, "backup.");
            assert!(config.borg.paths.is_empty());
            assert!(!config.borg.is_enabled());
            assert!(config.borg.prune);
            assert!(!config.btrfs.skip_redundant);
            assert_eq!(config.keeps.len(), 1);
            assert_eq!(config.keeps[0].interval, Duration::from_secs(3600));
            assert!(!config.keeps[0].backup);
            Ok(())
        });
    }

    #[test]
    fn test_env_var_override() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("snapkeep.toml", EXAMPLE_CONFIG1)?;
            jail.set_env("SNAPKEEP__BORG__PREFIX", "data.");
            jail.set_env("SNAPKEEP__BTRFS__SKIP_REDUNDANT", "true");

            let config = Configuration::load_from_path(Path::new("snapkeep.toml")).unwrap();
            assert_eq!(config.borg.prefix, "data.");
            assert!(config.btrfs.skip_redundant);
            Ok(())
        });
    }

    #[test]
    fn test_missing_file() {
        let result = Configuration::load_from_path(Path::new("/nonexistent/snapkeep.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_missing_source_is_invalid() {
        let result = Configuration::load_from_str("[[keeps]]\ninterval = \"day\"\namount = 3\n");
        assert!(matches!(
            result,
            Err(ConfigError::MissingField("btrfs.source_path"))
        ));
    }

    #[test]
    fn test_zero_amount_is_invalid() {
        let mut config = Configuration::load_from_str(EXAMPLE_CONFIG2).unwrap();
        config.keeps[0].amount = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ZeroAmount { index: 0 })
        ));
    }

    #[test]
    fn test_no_rules_is_invalid() {
        let mut config = Configuration::load_from_str(EXAMPLE_CONFIG2).unwrap();
        config.keeps.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NoRetentionRules)
        ));
    }

    #[test]
    fn test_time_origin_must_match_format() {
        let mut config = Configuration::load_from_str(EXAMPLE_CONFIG2).unwrap();
        config.time_origin = Some("2024-05-01 07:15".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidTimeOrigin { .. })
        ));
    }

    #[test]
    fn test_absolute_archive_path_is_invalid() {
        let mut config = Configuration::load_from_str(EXAMPLE_CONFIG2).unwrap();
        config.borg.repositories = vec!["/mnt/bigdisk".to_string()];
        config.borg.paths = vec![PathBuf::from("/etc")];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::AbsoluteArchivePath(_))
        ));
    }
}
