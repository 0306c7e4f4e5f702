//! Capability traits for the external collaborators of the swarm
//!
//! A [`DataSource`] hands out telemetry records and a [`Sink`] accepts
//! formatted payloads. Concrete implementations are chosen when the swarm or
//! uploader is constructed; see [`crate::sources`] and [`crate::sinks`].

use crate::{
    error::IotSwarmResult,
    payload::Payload,
    types::{Record, SiteId},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;

/// Time-series data the swarm reads from
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// All site ids that have data in `table`
    async fn list_sites(&self, table: &str) -> IotSwarmResult<BTreeSet<SiteId>>;

    /// Records for a site with a timestamp strictly greater than `since`,
    /// oldest first
    async fn fetch_since(
        &self,
        table: &str,
        site_id: &str,
        since: DateTime<Utc>,
    ) -> IotSwarmResult<Vec<Record>>;

    /// The most recent record for a site, if any
    async fn latest(&self, table: &str, site_id: &str) -> IotSwarmResult<Option<Record>> {
        let records = self
            .fetch_since(table, site_id, DateTime::<Utc>::MIN_UTC)
            .await?;
        Ok(records.into_iter().max_by_key(|r| r.timestamp))
    }

    /// The reading a simulated device sends on its next cycle
    ///
    /// Replaying sources step through a site's rows oldest first and start
    /// over after the last one; anything else sends its newest record.
    async fn next_reading(&self, table: &str, site_id: &str) -> IotSwarmResult<Option<Record>> {
        self.latest(table, site_id).await
    }
}

/// Downstream receiver of payloads (message broker, object store)
#[async_trait]
pub trait Sink: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &str;

    /// Deliver one payload under `topic`
    async fn publish(&self, topic: &str, payload: &Payload) -> IotSwarmResult<()>;
}
