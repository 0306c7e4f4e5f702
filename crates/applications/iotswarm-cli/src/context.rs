//! Wiring between configuration and the library crates

use crate::config::{AppConfig, SinkConfig, SourceConfig};
use iotswarm_core::{
    sinks::{FileSink, LogSink},
    sources::{MemoryDataSource, SqliteDataSource},
    CancellationToken, DataSource, IotSwarmError, IotSwarmResult, Sink, SiteId,
};
use iotswarm_live::{LiveUploader, Selection};
use iotswarm_state::CheckpointStore;
use iotswarm_swarm::{Device, DeviceConfig, Swarm};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info};

/// Command line overrides for `simulate`
#[derive(Debug, Clone, Default)]
pub struct SimulateOptions {
    /// Limit on the number of devices; `None` runs one per site
    pub devices: Option<usize>,
    pub max_cycles: Option<u64>,
    pub sleep_time: Option<Duration>,
    pub timeout_secs: Option<u64>,
    pub swarm_name: Option<String>,
}

/// Command line overrides for `send-live-data`
#[derive(Debug, Clone, Default)]
pub struct LiveOptions {
    pub tables: Vec<String>,
    pub sites: Vec<String>,
    pub fallback_hours: Option<u32>,
    pub batch_sizes: Vec<usize>,
    pub dry_run: bool,
}

/// Resolved configuration plus the shared source and sink
pub struct AppContext {
    config: AppConfig,
    source: Arc<dyn DataSource>,
    sink: Arc<dyn Sink>,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("source", &self.source.name())
            .field("sink", &self.sink.name())
            .finish()
    }
}

impl AppContext {
    /// Open the configured source and sink
    pub async fn from_config(config: AppConfig) -> IotSwarmResult<Self> {
        let source: Arc<dyn DataSource> = match &config.source {
            SourceConfig::Sqlite { path } => Arc::new(SqliteDataSource::open(path).await?),
            SourceConfig::Memory => Arc::new(MemoryDataSource::new()),
        };
        let sink: Arc<dyn Sink> = match &config.sink {
            SinkConfig::Log => Arc::new(LogSink::new()),
            SinkConfig::File { root } => Arc::new(FileSink::new(root)),
        };

        debug!(source = source.name(), sink = sink.name(), "Application context ready");
        Ok(Self::with_parts(config, source, sink))
    }

    /// Use an already constructed source and sink
    pub fn with_parts(config: AppConfig, source: Arc<dyn DataSource>, sink: Arc<dyn Sink>) -> Self {
        Self {
            config,
            source,
            sink,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Sites to simulate: the configured list, or every site with data
    pub async fn site_ids(&self, limit: Option<usize>) -> IotSwarmResult<Vec<SiteId>> {
        let device = &self.config.device;
        let mut sites: Vec<SiteId> = if device.sites.is_empty() {
            let cancel = CancellationToken::new();
            self.config
                .retry
                .run("list_sites", &cancel, || self.source.list_sites(&device.table))
                .await?
                .into_iter()
                .collect()
        } else {
            device.sites.clone()
        };

        if let Some(limit) = limit.filter(|l| *l > 0) {
            sites.truncate(limit);
        }
        Ok(sites)
    }

    /// One device per site, sharing the source, sink and retry policy
    pub async fn build_swarm(&self, options: &SimulateOptions) -> IotSwarmResult<Swarm> {
        let sites = self.site_ids(options.devices).await?;
        if sites.is_empty() {
            return Err(IotSwarmError::config(format!(
                "no sites found for table '{}'",
                self.config.device.table
            )));
        }

        let defaults = &self.config.device;
        let devices = sites
            .into_iter()
            .map(|site| {
                let config = DeviceConfig {
                    sleep_time_ms: options
                        .sleep_time
                        .map(|d| d.as_millis() as u64)
                        .unwrap_or(defaults.sleep_time_ms),
                    max_cycles: options.max_cycles.or(defaults.max_cycles),
                    delay_start: defaults.delay_start,
                    no_send_probability: defaults.no_send_probability,
                    topic_prefix: defaults.topic_prefix.clone(),
                    topic_suffix: defaults.topic_suffix.clone(),
                    profile: defaults.profile.clone(),
                    ..DeviceConfig::new(site, defaults.table.clone())
                };
                Device::new(
                    config,
                    Arc::clone(&self.source),
                    Arc::clone(&self.sink),
                    self.config.retry.clone(),
                )
            })
            .collect::<IotSwarmResult<Vec<_>>>()?;

        let mut swarm_config = self.config.swarm.clone();
        if options.timeout_secs.is_some() {
            swarm_config.run_timeout_secs = options.timeout_secs;
        }
        if options.swarm_name.is_some() {
            swarm_config.name = options.swarm_name.clone();
        }

        let swarm = Swarm::create(devices, swarm_config)?;
        info!(swarm = swarm.name(), devices = swarm.len(), "Swarm created");
        Ok(swarm)
    }

    /// Open the checkpoint store under `state.dir`
    pub async fn open_store(&self) -> IotSwarmResult<Arc<CheckpointStore>> {
        let state = &self.config.state;
        Ok(Arc::new(CheckpointStore::open(&state.dir, &state.name).await?))
    }

    /// Uploader with command line overrides applied
    ///
    /// Returns the uploader with the resolved table selection and fallback
    /// window.
    pub fn live_uploader(
        &self,
        store: Arc<CheckpointStore>,
        options: &LiveOptions,
    ) -> IotSwarmResult<(LiveUploader, Selection, u32)> {
        let tables = Selection::from_args(options.tables.iter().cloned());
        let mut config = self.config.live.clone();
        config.apply_batch_sizes(&tables, &options.batch_sizes)?;
        config.dry_run |= options.dry_run;

        let fallback_hours = options.fallback_hours.unwrap_or(config.fallback_hours);
        let uploader = LiveUploader::new(
            Arc::clone(&self.source),
            Arc::clone(&self.sink),
            store,
            config,
            self.config.device.profile.clone(),
        )?;
        Ok((uploader, tables, fallback_hours))
    }
}
