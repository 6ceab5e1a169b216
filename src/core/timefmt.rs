//! Configurable strftime-style timestamp format for snapshot names.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// A validated strftime-style format string.
///
/// The format must produce a string that parses back to the same instant,
/// which rules out formats that drop the date or the time of day.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimestampFormat(String);

#[derive(Debug, Error)]
pub enum TimeFormatError {
    #[error("timestamp format {format:?} does not round-trip: {detail}")]
    NotRoundTrip { format: String, detail: String },
}

impl TimestampFormat {
    pub fn new(format: impl Into<String>) -> Result<Self, TimeFormatError> {
        let format = format.into();
        let probe = NaiveDateTime::parse_from_str("2001-02-03 04:05:06", "%Y-%m-%d %H:%M:%S")
            .unwrap_or_default();
        let rendered = format_checked(&format, probe).map_err(|detail| {
            TimeFormatError::NotRoundTrip {
                format: format.clone(),
                detail,
            }
        })?;
        match NaiveDateTime::parse_from_str(&rendered, &format) {
            Ok(parsed) if parsed == probe => Ok(Self(format)),
            Ok(parsed) => Err(TimeFormatError::NotRoundTrip {
                format,
                detail: format!("{probe} formatted to {rendered:?} but parsed back as {parsed}"),
            }),
            Err(err) => Err(TimeFormatError::NotRoundTrip {
                format,
                detail: err.to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn format(&self, timestamp: NaiveDateTime) -> String {
        timestamp.format(&self.0).to_string()
    }

    /// Parse a timestamp from the tail of a snapshot name.
    ///
    /// The whole input must be consumed; trailing garbage fails. Collision
    /// suffixes (`-N`) are handled by the catalog, not here.
    pub fn parse(&self, input: &str) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(input, &self.0).ok()
    }
}

impl Default for TimestampFormat {
    fn default() -> Self {
        Self(DEFAULT_TIMESTAMP_FORMAT.to_string())
    }
}

impl TryFrom<String> for TimestampFormat {
    type Error = TimeFormatError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TimestampFormat> for String {
    fn from(value: TimestampFormat) -> Self {
        value.0
    }
}

/// `chrono` panics on invalid format strings when writing; probe the items
/// iterator for errors before rendering.
fn format_checked(format: &str, timestamp: NaiveDateTime) -> Result<String, String> {
    use chrono::format::{Item, StrftimeItems};
    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err("unrecognised strftime item".to_string());
    }
    Ok(timestamp.format(format).to_string())
}
