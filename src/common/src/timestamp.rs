//! Timestamps embedded in snapshot and archive names.
//!
//! A name is `<prefix><timestamp>` where the timestamp is rendered with a
//! strftime-style pattern. The same pattern parses names back, so a timestamp
//! never carries more resolution than the pattern encodes.

use chrono::format::{self, Item, Parsed, StrftimeItems};
use chrono::{NaiveDate, NaiveDateTime};
use thiserror::Error;

/// Default pattern, e.g. `2025_02_17__03_00_48`.
pub const DEFAULT_DATETIME_FORMAT: &str = "%Y_%m_%d__%H_%M_%S";

/// A validated strftime pattern for timestamps in entity names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampFormat {
    pattern: String,
}

impl TimestampFormat {
    /// Validate `pattern` and wrap it.
    ///
    /// The pattern must only contain specifiers chrono understands, and a
    /// rendered timestamp must parse back to a value that renders the same.
    pub fn new(pattern: impl Into<String>) -> Result<Self, TimestampError> {
        let pattern = pattern.into();
        if pattern.is_empty()
            || StrftimeItems::new(&pattern).any(|item| matches!(item, Item::Error))
        {
            return Err(TimestampError::InvalidFormat { pattern });
        }

        let format = Self { pattern };
        let probe = NaiveDate::from_ymd_opt(2024, 11, 23)
            .and_then(|d| d.and_hms_opt(15, 47, 38))
            .ok_or_else(|| TimestampError::InvalidFormat {
                pattern: format.pattern.clone(),
            })?;
        let rendered = format.format(probe);
        match format.parse(&rendered) {
            Ok(parsed) if format.format(parsed) == rendered => Ok(format),
            _ => Err(TimestampError::NotRoundTrip {
                pattern: format.pattern,
            }),
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn format(&self, timestamp: NaiveDateTime) -> String {
        timestamp.format(&self.pattern).to_string()
    }

    /// Parse a rendered timestamp.
    ///
    /// Time fields the pattern does not encode are zero, so `%Y_%m_%d__%H`
    /// yields whole hours and a date-only pattern yields midnight.
    pub fn parse(&self, value: &str) -> Result<NaiveDateTime, TimestampError> {
        self.parse_fields(value).map_err(|source| TimestampError::Parse {
            value: value.to_string(),
            pattern: self.pattern.clone(),
            source,
        })
    }

    fn parse_fields(&self, value: &str) -> Result<NaiveDateTime, chrono::ParseError> {
        let mut parsed = Parsed::new();
        format::parse(&mut parsed, value, StrftimeItems::new(&self.pattern))?;
        if parsed.hour_mod_12().is_none() {
            parsed.set_hour(0)?;
        }
        if parsed.minute().is_none() {
            parsed.set_minute(0)?;
        }
        if parsed.second().is_none() {
            parsed.set_second(0)?;
        }
        parsed.to_naive_datetime_with_offset(0)
    }

    /// Drop whatever resolution the pattern cannot represent.
    pub fn truncate(&self, timestamp: NaiveDateTime) -> Result<NaiveDateTime, TimestampError> {
        self.parse(&self.format(timestamp))
    }

    /// Render the full entity name for `timestamp`.
    pub fn name(&self, prefix: &str, timestamp: NaiveDateTime) -> String {
        format!("{prefix}{}", self.format(timestamp))
    }

    /// Extract the timestamp from `<prefix><timestamp>`.
    pub fn parse_suffix(&self, name: &str, prefix: &str) -> Result<NaiveDateTime, TimestampError> {
        let suffix = name
            .strip_prefix(prefix)
            .ok_or_else(|| TimestampError::MissingPrefix {
                name: name.to_string(),
                prefix: prefix.to_string(),
            })?;
        self.parse(suffix)
    }
}

impl Default for TimestampFormat {
    fn default() -> Self {
        Self {
            pattern: DEFAULT_DATETIME_FORMAT.to_string(),
        }
    }
}

#[derive(Error, Debug)]
pub enum TimestampError {
    #[error("Invalid datetime format '{pattern}'")]
    InvalidFormat { pattern: String },

    #[error("Datetime format '{pattern}' cannot parse the timestamps it renders")]
    NotRoundTrip { pattern: String },

    #[error("Cannot parse '{value}' with datetime format '{pattern}': {source}")]
    Parse {
        value: String,
        pattern: String,
        source: chrono::ParseError,
    },

    #[error("Name '{name}' should start with '{prefix}'")]
    MissingPrefix { name: String, prefix: String },
}
