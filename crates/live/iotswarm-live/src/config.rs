//! Live upload settings and table/site selection

use iotswarm_core::{IotSwarmError, IotSwarmResult, RetryPolicy, TableName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tables the uploader may forward from unless configured otherwise
pub const DEFAULT_PERMITTED_TABLES: [&str; 4] = [
    "LEVEL_1_NMDB_1HOUR",
    "LEVEL_1_PRECIP_1MIN",
    "LEVEL_1_PRECIP_RAINE_1MIN",
    "LEVEL_1_SOILMET_30MIN",
];

/// Word selecting every table or site
pub const ALL: &str = "all";

/// Settings for [`crate::LiveUploader`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveUploadConfig {
    /// Look-back window for pairs without a checkpoint
    pub fallback_hours: u32,
    /// Maximum rows per payload
    pub batch_size: usize,
    /// Per-table overrides of `batch_size`
    pub table_batch_sizes: BTreeMap<TableName, usize>,
    /// Tables that may be uploaded; `all` expands to this list
    pub permitted_tables: Vec<TableName>,
    /// Topic root; messages go to `<topic_prefix>/<table>/<site>`
    pub topic_prefix: String,
    /// Pairs processed at the same time
    pub max_concurrent_pairs: usize,
    /// Fetch and format without publishing or checkpointing
    pub dry_run: bool,
    /// Retry policy for source and sink calls
    pub retry: RetryPolicy,
}

impl Default for LiveUploadConfig {
    fn default() -> Self {
        Self {
            fallback_hours: 3,
            batch_size: 1,
            table_batch_sizes: BTreeMap::new(),
            permitted_tables: DEFAULT_PERMITTED_TABLES.iter().map(|t| t.to_string()).collect(),
            topic_prefix: "live".to_string(),
            max_concurrent_pairs: 4,
            dry_run: false,
            retry: RetryPolicy::default(),
        }
    }
}

impl LiveUploadConfig {
    pub fn validate(&self) -> IotSwarmResult<()> {
        if self.batch_size == 0 {
            return Err(IotSwarmError::config("live.batch_size must be at least 1"));
        }
        if let Some((table, _)) = self.table_batch_sizes.iter().find(|(_, size)| **size == 0) {
            return Err(IotSwarmError::config(format!(
                "live.table_batch_sizes.{table} must be at least 1"
            )));
        }
        if self.max_concurrent_pairs == 0 {
            return Err(IotSwarmError::config(
                "live.max_concurrent_pairs must be at least 1",
            ));
        }
        if self.permitted_tables.is_empty() {
            return Err(IotSwarmError::config("live.permitted_tables must not be empty"));
        }
        self.retry.validate()
    }

    /// Rows per payload for `table`
    ///
    /// Override keys match table names case-insensitively, as SQL does.
    pub fn batch_size_for(&self, table: &str) -> usize {
        self.table_batch_sizes
            .get(table)
            .or_else(|| {
                self.table_batch_sizes
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(table))
                    .map(|(_, size)| size)
            })
            .copied()
            .unwrap_or(self.batch_size)
    }

    /// Apply `--batch-size` values given on the command line
    ///
    /// A single value applies to every table. Several values pair up with
    /// an explicit table list of the same length.
    pub fn apply_batch_sizes(&mut self, tables: &Selection, sizes: &[usize]) -> IotSwarmResult<()> {
        match (sizes, tables) {
            ([], _) => {}
            ([size], _) => {
                self.batch_size = *size;
                self.table_batch_sizes.clear();
            }
            (sizes, Selection::Only(tables)) if sizes.len() == tables.len() => {
                self.table_batch_sizes = tables.iter().cloned().zip(sizes.iter().copied()).collect();
            }
            (sizes, tables) => {
                let table_count = match tables {
                    Selection::All => "all".to_string(),
                    Selection::Only(tables) => tables.len().to_string(),
                };
                return Err(IotSwarmError::config(format!(
                    "got {} batch sizes for {table_count} tables; give one size or one per table",
                    sizes.len()
                )));
            }
        }
        self.validate()
    }

    /// Message topic for one pair
    pub fn topic_for(&self, table: &str, site_id: &str) -> String {
        let prefix = self.topic_prefix.trim_matches('/');
        if prefix.is_empty() {
            format!("{table}/{site_id}")
        } else {
            format!("{prefix}/{table}/{site_id}")
        }
    }
}

/// Either everything available or an explicit list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    All,
    Only(Vec<String>),
}

impl Selection {
    /// An empty list or one containing `all` selects everything
    pub fn from_args<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let values: Vec<String> = values.into_iter().map(Into::into).collect();
        if values.is_empty() || values.iter().any(|v| v.eq_ignore_ascii_case(ALL)) {
            Selection::All
        } else {
            let mut unique = Vec::with_capacity(values.len());
            for value in values {
                if !unique.contains(&value) {
                    unique.push(value);
                }
            }
            Selection::Only(unique)
        }
    }

    pub fn is_all(&self) -> bool {
        matches!(self, Selection::All)
    }
}
