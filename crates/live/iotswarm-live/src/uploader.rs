//! One incremental upload pass over (table, site) pairs
//!
//! For every pair the uploader reads the checkpoint (or falls back to a
//! look-back window), fetches records strictly newer than it, publishes them
//! oldest first and advances the checkpoint only after the sink confirmed a
//! payload. A pair that fails keeps its checkpoint, so the next run resends
//! from the same point.

use crate::{
    config::{LiveUploadConfig, Selection},
    report::{PairOutcome, PairReport, UploadReport},
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::stream::{self, StreamExt};
use iotswarm_core::{
    types::newer_than, CancellationToken, DataSource, DeviceProfile, IotSwarmError,
    IotSwarmResult, PayloadBuilder, Sink, SiteId, TableName,
};
use iotswarm_state::CheckpointStore;
use std::{sync::Arc, time::Instant};
use tracing::{debug, info, warn};

/// Forwards readings newer than each pair's checkpoint
pub struct LiveUploader {
    source: Arc<dyn DataSource>,
    sink: Arc<dyn Sink>,
    store: Arc<CheckpointStore>,
    config: LiveUploadConfig,
    profile: DeviceProfile,
    cancel: CancellationToken,
}

impl std::fmt::Debug for LiveUploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveUploader")
            .field("source", &self.source.name())
            .field("sink", &self.sink.name())
            .field("store", &self.store)
            .field("config", &self.config)
            .finish()
    }
}

impl LiveUploader {
    pub fn new(
        source: Arc<dyn DataSource>,
        sink: Arc<dyn Sink>,
        store: Arc<CheckpointStore>,
        config: LiveUploadConfig,
        profile: DeviceProfile,
    ) -> IotSwarmResult<Self> {
        config.validate()?;
        Ok(Self {
            source,
            sink,
            store,
            config,
            profile,
            cancel: CancellationToken::new(),
        })
    }

    /// Share an external stop signal, e.g. from a Ctrl-C handler
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &LiveUploadConfig {
        &self.config
    }

    pub async fn run(
        &self,
        tables: &Selection,
        sites: &Selection,
        fallback_hours: u32,
    ) -> IotSwarmResult<UploadReport> {
        self.run_at(tables, sites, fallback_hours, Utc::now()).await
    }

    /// Run one pass treating `now` as the current time
    ///
    /// Only a table outside the permitted set is an error; every other
    /// failure is recorded in the report. Once the cancellation token fires,
    /// pairs that have not started and chunks not yet sent end as
    /// [`IotSwarmError::Cancelled`] failures with their checkpoints untouched.
    pub async fn run_at(
        &self,
        tables: &Selection,
        sites: &Selection,
        fallback_hours: u32,
        now: DateTime<Utc>,
    ) -> IotSwarmResult<UploadReport> {
        let started = Instant::now();
        let tables = self.resolve_tables(tables)?;
        let fallback = now - ChronoDuration::hours(i64::from(fallback_hours));

        info!(
            tables = ?tables,
            sites = ?sites,
            fallback_hours,
            dry_run = self.config.dry_run,
            "Starting live upload"
        );

        let mut report = UploadReport::default();
        let mut pairs: Vec<(TableName, SiteId)> = Vec::new();
        for table in tables {
            match self.resolve_sites(&table, sites).await {
                Ok(table_sites) => {
                    debug!(table = %table, sites = table_sites.len(), "Resolved sites");
                    pairs.extend(table_sites.into_iter().map(|site| (table.clone(), site)));
                }
                Err(e) => {
                    warn!(table = %table, error = %e, "Could not list sites for table");
                    report.table_errors.push((table, e));
                }
            }
        }

        let mut results: Vec<PairReport> = stream::iter(pairs)
            .map(|(table, site_id)| self.process_pair(table, site_id, fallback))
            .buffer_unordered(self.config.max_concurrent_pairs)
            .collect()
            .await;
        results.sort_by(|a, b| (&a.table, &a.site_id).cmp(&(&b.table, &b.site_id)));

        report.pairs = results;
        report.elapsed = started.elapsed();

        info!(
            pairs = report.pairs.len(),
            forwarded_records = report.forwarded_records(),
            skipped = report.skipped(),
            failed = report.failed(),
            table_errors = report.table_errors.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Live upload finished"
        );
        Ok(report)
    }

    fn resolve_tables(&self, tables: &Selection) -> IotSwarmResult<Vec<TableName>> {
        match tables {
            Selection::All => Ok(self.config.permitted_tables.clone()),
            Selection::Only(requested) => {
                if let Some(table) = requested
                    .iter()
                    .find(|t| !self.config.permitted_tables.contains(t))
                {
                    return Err(IotSwarmError::config(format!(
                        "table '{table}' is not permitted (allowed: {})",
                        self.config.permitted_tables.join(", ")
                    )));
                }
                Ok(requested.clone())
            }
        }
    }

    async fn resolve_sites(&self, table: &str, sites: &Selection) -> IotSwarmResult<Vec<SiteId>> {
        match sites {
            Selection::Only(sites) => Ok(sites.clone()),
            Selection::All => {
                let sites = self
                    .config
                    .retry
                    .run("list_sites", &self.cancel, || self.source.list_sites(table))
                    .await?;
                Ok(sites.into_iter().collect())
            }
        }
    }

    async fn process_pair(
        &self,
        table: TableName,
        site_id: SiteId,
        fallback: DateTime<Utc>,
    ) -> PairReport {
        let since = match self.store.get(&table, &site_id).await {
            Some(checkpoint) => checkpoint.last_timestamp,
            None => {
                debug!(table = %table, site_id = %site_id, "No checkpoint, using fallback window");
                fallback
            }
        };

        let outcome = self.forward(&table, &site_id, since).await;
        match &outcome {
            PairOutcome::Failed { error, records } => {
                warn!(table = %table, site_id = %site_id, forwarded = records, error = %error, "Pair failed");
            }
            PairOutcome::Skipped => {
                debug!(table = %table, site_id = %site_id, "Got 0 new rows");
            }
            _ => {}
        }

        PairReport {
            table,
            site_id,
            since,
            outcome,
        }
    }

    async fn forward(&self, table: &str, site_id: &str, since: DateTime<Utc>) -> PairOutcome {
        if self.cancel.is_cancelled() {
            return PairOutcome::Failed {
                error: IotSwarmError::Cancelled,
                records: 0,
            };
        }

        let records = match self
            .config
            .retry
            .run("fetch_since", &self.cancel, || {
                self.source.fetch_since(table, site_id, since)
            })
            .await
        {
            Ok(records) => newer_than(records, since),
            Err(error) => return PairOutcome::Failed { error, records: 0 },
        };

        if records.is_empty() {
            return PairOutcome::Skipped;
        }

        let builder = PayloadBuilder::new(DeviceProfile {
            table_name: table.to_string(),
            ..self.profile.clone()
        });
        let batch_size = self.config.batch_size_for(table);
        debug!(table, site_id, rows = records.len(), batch_size, "Got new rows");

        if self.config.dry_run {
            let mut payloads = 0;
            for chunk in records.chunks(batch_size) {
                if let Err(error) = builder.build(site_id, chunk) {
                    return PairOutcome::Failed { error, records: 0 };
                }
                payloads += 1;
            }
            info!(table, site_id, records = records.len(), payloads, "Dry run, nothing sent");
            return PairOutcome::DryRun {
                records: records.len(),
                payloads,
            };
        }

        let topic = self.config.topic_for(table, site_id);
        let mut forwarded = 0;
        let mut payloads = 0;
        let mut checkpoint = since;

        for chunk in records.chunks(batch_size) {
            // Stop between chunks; a confirmed chunk has already been checkpointed
            if self.cancel.is_cancelled() {
                info!(table, site_id, forwarded, "Cancelled, leaving remaining rows for the next run");
                return PairOutcome::Failed {
                    error: IotSwarmError::Cancelled,
                    records: forwarded,
                };
            }
            if let Err(error) = self.send_chunk(&builder, &topic, table, site_id, chunk).await {
                return PairOutcome::Failed {
                    error,
                    records: forwarded,
                };
            }
            forwarded += chunk.len();
            payloads += 1;
            if let Some(last) = chunk.last() {
                checkpoint = last.timestamp;
            }
        }

        info!(table, site_id, records = forwarded, payloads, checkpoint = %checkpoint, "Forwarded new rows");
        PairOutcome::Forwarded {
            records: forwarded,
            payloads,
            checkpoint,
        }
    }

    /// Publish one chunk, then persist its newest timestamp
    async fn send_chunk(
        &self,
        builder: &PayloadBuilder,
        topic: &str,
        table: &str,
        site_id: &str,
        chunk: &[iotswarm_core::Record],
    ) -> IotSwarmResult<()> {
        let payload = builder.build(site_id, chunk)?;
        let newest = payload
            .latest_time()
            .ok_or_else(|| IotSwarmError::internal("built an empty payload"))?;

        self.config
            .retry
            .run("publish", &self.cancel, || self.sink.publish(topic, &payload))
            .await?;

        metrics::counter!("iotswarm_messages_published_total", "mode" => "live").increment(1);
        metrics::counter!("iotswarm_records_forwarded_total").increment(chunk.len() as u64);

        self.store.update(table, site_id, newest).await?;
        Ok(())
    }
}
