//! Common types for sources, sinks and the orchestration layers

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identifier of a monitoring site
pub type SiteId = String;

/// Name of a time-series table
pub type TableName = String;

/// Name of the column holding the reading time
pub const TIMESTAMP_COLUMN: &str = "date_time";

/// Name of the column identifying the site
pub const SITE_COLUMN: &str = "site_id";

/// Storage layout of `date_time` values: `YYYY-MM-DD HH:MM:SS[.fff]`
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Parse a stored reading time, assuming UTC when no offset is given
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}

/// Render a reading time in the storage layout
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.format("%Y-%m-%d %H:%M:%S%.3f").to_string()
}

/// One row of telemetry for a single site
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Time the reading was taken
    pub timestamp: DateTime<Utc>,
    /// Remaining columns keyed by name
    pub values: Map<String, Value>,
}

impl Record {
    /// Create a record with no values
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            values: Map::new(),
        }
    }

    /// Builder-style helper to add a column value
    pub fn with_value(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.values.insert(column.into(), value.into());
        self
    }
}

/// Sort records oldest first, keeping only those strictly newer than `since`
pub fn newer_than(mut records: Vec<Record>, since: DateTime<Utc>) -> Vec<Record> {
    records.retain(|r| r.timestamp > since);
    records.sort_by_key(|r| r.timestamp);
    records
}
