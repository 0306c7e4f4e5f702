//! In-memory checkpoint document

use chrono::{DateTime, Utc};
use iotswarm_core::{SiteId, TableName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Last forwarded reading time for one (table, site) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub table: TableName,
    pub site_id: SiteId,
    pub last_timestamp: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Result of merging a candidate timestamp into the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The checkpoint moved forward from `previous` (none for a new pair)
    Advanced { previous: Option<DateTime<Utc>> },
    /// The stored timestamp already dominates the candidate
    Unchanged,
}

impl UpdateOutcome {
    pub fn is_advanced(&self) -> bool {
        matches!(self, UpdateOutcome::Advanced { .. })
    }
}

/// Every checkpoint, grouped by table then site
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub tables: BTreeMap<TableName, BTreeMap<SiteId, CheckpointRecord>>,
}

impl Snapshot {
    pub fn get(&self, table: &str, site_id: &str) -> Option<&CheckpointRecord> {
        self.tables.get(table).and_then(|sites| sites.get(site_id))
    }

    pub fn len(&self) -> usize {
        self.tables.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Merge `candidate` as `max(stored, candidate)`
    pub fn apply(
        &mut self,
        table: &str,
        site_id: &str,
        candidate: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> UpdateOutcome {
        let sites = self.tables.entry(table.to_string()).or_default();
        match sites.get_mut(site_id) {
            Some(record) if record.last_timestamp >= candidate => UpdateOutcome::Unchanged,
            Some(record) => {
                let previous = record.last_timestamp;
                record.last_timestamp = candidate;
                record.updated_at = now;
                UpdateOutcome::Advanced {
                    previous: Some(previous),
                }
            }
            None => {
                sites.insert(
                    site_id.to_string(),
                    CheckpointRecord {
                        table: table.to_string(),
                        site_id: site_id.to_string(),
                        last_timestamp: candidate,
                        updated_at: now,
                    },
                );
                UpdateOutcome::Advanced { previous: None }
            }
        }
    }

    /// Find a record whose identity disagrees with the keys it is stored under
    pub(crate) fn misfiled(&self) -> Option<(&str, &str)> {
        self.tables.iter().find_map(|(table, sites)| {
            sites
                .iter()
                .find(|(site, record)| &record.table != table || &record.site_id != *site)
                .map(|(site, _)| (table.as_str(), site.as_str()))
        })
    }
}
