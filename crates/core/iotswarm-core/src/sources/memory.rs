//! In-memory data source for tests and dry runs

use crate::{
    error::{IotSwarmError, IotSwarmResult},
    traits::DataSource,
    types::{newer_than, Record, SiteId, TableName},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

type Tables = BTreeMap<TableName, BTreeMap<SiteId, Vec<Record>>>;

/// Records held in memory, keyed by table and site
#[derive(Clone, Debug, Default)]
pub struct MemoryDataSource {
    tables: Arc<RwLock<Tables>>,
    failure: Arc<RwLock<Option<IotSwarmError>>>,
    cursors: Arc<Mutex<HashMap<(TableName, SiteId), usize>>>,
}

impl MemoryDataSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a source from `(table, site, record)` triples
    pub fn from_records<I, T, S>(records: I) -> Self
    where
        I: IntoIterator<Item = (T, S, Record)>,
        T: Into<TableName>,
        S: Into<SiteId>,
    {
        let mut tables = Tables::new();
        for (table, site, record) in records {
            tables
                .entry(table.into())
                .or_default()
                .entry(site.into())
                .or_default()
                .push(record);
        }

        Self {
            tables: Arc::new(RwLock::new(tables)),
            failure: Arc::default(),
            cursors: Arc::default(),
        }
    }

    pub async fn insert(&self, table: &str, site_id: &str, record: Record) {
        let mut tables = self.tables.write().await;
        tables
            .entry(table.to_string())
            .or_default()
            .entry(site_id.to_string())
            .or_default()
            .push(record);
    }

    /// Make every subsequent call fail with `error`, or succeed again with `None`
    pub async fn set_failure(&self, error: Option<IotSwarmError>) {
        *self.failure.write().await = error;
    }

    async fn check_failure(&self) -> IotSwarmResult<()> {
        match self.failure.read().await.as_ref() {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DataSource for MemoryDataSource {
    fn name(&self) -> &str {
        "memory"
    }

    async fn list_sites(&self, table: &str) -> IotSwarmResult<BTreeSet<SiteId>> {
        self.check_failure().await?;
        let tables = self.tables.read().await;
        Ok(tables
            .get(table)
            .map(|sites| {
                sites
                    .iter()
                    .filter(|(_, records)| !records.is_empty())
                    .map(|(site, _)| site.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn fetch_since(
        &self,
        table: &str,
        site_id: &str,
        since: DateTime<Utc>,
    ) -> IotSwarmResult<Vec<Record>> {
        self.check_failure().await?;
        let tables = self.tables.read().await;
        let records = tables
            .get(table)
            .and_then(|sites| sites.get(site_id))
            .cloned()
            .unwrap_or_default();
        Ok(newer_than(records, since))
    }

    async fn next_reading(&self, table: &str, site_id: &str) -> IotSwarmResult<Option<Record>> {
        self.check_failure().await?;
        let tables = self.tables.read().await;
        let mut records: Vec<&Record> = match tables.get(table).and_then(|sites| sites.get(site_id)) {
            Some(records) if !records.is_empty() => records.iter().collect(),
            _ => return Ok(None),
        };
        records.sort_by_key(|r| r.timestamp);

        let mut cursors = self.cursors.lock().await;
        let position = cursors
            .entry((table.to_string(), site_id.to_string()))
            .or_default();
        if *position >= records.len() {
            *position = 0;
        }
        let record = records[*position].clone();
        *position += 1;
        Ok(Some(record))
    }
}
