//! Outcome types of an upload run

use chrono::{DateTime, Utc};
use iotswarm_core::{IotSwarmError, SiteId, TableName};
use std::time::Duration;

/// What happened to one (table, site) pair
#[derive(Debug, Clone, PartialEq)]
pub enum PairOutcome {
    /// New records were published and the checkpoint advanced to `checkpoint`
    Forwarded {
        records: usize,
        payloads: usize,
        checkpoint: DateTime<Utc>,
    },
    /// Nothing newer than the lower bound
    Skipped,
    /// The pair stopped at `error`; `records` were forwarded before it
    Failed { error: IotSwarmError, records: usize },
    /// Records were fetched and formatted but not sent
    DryRun { records: usize, payloads: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PairReport {
    pub table: TableName,
    pub site_id: SiteId,
    /// Exclusive lower bound used for the fetch
    pub since: DateTime<Utc>,
    pub outcome: PairOutcome,
}

/// Aggregate result of one [`crate::LiveUploader`] pass
#[derive(Debug, Clone, Default)]
pub struct UploadReport {
    /// Per-pair outcomes ordered by table then site
    pub pairs: Vec<PairReport>,
    /// Tables whose site list could not be resolved
    pub table_errors: Vec<(TableName, IotSwarmError)>,
    pub elapsed: Duration,
}

impl UploadReport {
    pub fn forwarded_records(&self) -> usize {
        self.pairs
            .iter()
            .map(|p| match &p.outcome {
                PairOutcome::Forwarded { records, .. } | PairOutcome::Failed { records, .. } => {
                    *records
                }
                _ => 0,
            })
            .sum()
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, PairOutcome::Skipped))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, PairOutcome::Failed { .. }))
    }

    fn count(&self, predicate: impl Fn(&PairOutcome) -> bool) -> usize {
        self.pairs.iter().filter(|p| predicate(&p.outcome)).count()
    }

    /// Every failure in the run, labelled `table` or `table/site`
    pub fn errors(&self) -> Vec<(String, IotSwarmError)> {
        let table_errors = self
            .table_errors
            .iter()
            .map(|(table, error)| (table.clone(), error.clone()));
        let pair_errors = self.pairs.iter().filter_map(|p| match &p.outcome {
            PairOutcome::Failed { error, .. } => {
                Some((format!("{}/{}", p.table, p.site_id), error.clone()))
            }
            _ => None,
        });
        table_errors.chain(pair_errors).collect()
    }

    pub fn find(&self, table: &str, site_id: &str) -> Option<&PairReport> {
        self.pairs
            .iter()
            .find(|p| p.table == table && p.site_id == site_id)
    }
}
