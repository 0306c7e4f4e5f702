//! A single simulated telemetry device
//!
//! A device repeatedly asks its data source for the next reading of its site,
//! publishes it as a CR1000X payload and sleeps. Replaying sources hand out
//! the site's rows in turn. Source and sink calls
//! run under the device's [`RetryPolicy`]; a permanent error or exhausted
//! retries end the device as [`DeviceState::Failed`]. The stop signal is
//! honoured between cycles, while sleeping and during retry backoff.

use iotswarm_core::{
    CancellationToken, DataSource, DeviceProfile, IotSwarmError, IotSwarmResult, PayloadBuilder,
    RetryPolicy, Sink, SiteId, TableName,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc, time::Duration};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Lifecycle of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceState {
    Created,
    Running,
    Sleeping,
    Stopped,
    Failed,
}

impl DeviceState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeviceState::Stopped | DeviceState::Failed)
    }

    /// Whether the state machine permits moving from `self` to `next`
    pub fn can_transition_to(&self, next: DeviceState) -> bool {
        use DeviceState::*;
        matches!(
            (self, next),
            (Created, Running)
                | (Created, Stopped)
                | (Running, Sleeping)
                | (Running, Stopped)
                | (Running, Failed)
                | (Sleeping, Running)
                | (Sleeping, Stopped)
        )
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceState::Created => "CREATED",
            DeviceState::Running => "RUNNING",
            DeviceState::Sleeping => "SLEEPING",
            DeviceState::Stopped => "STOPPED",
            DeviceState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

fn default_sleep_time_ms() -> u64 {
    60_000
}

/// Settings for one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Site the device impersonates
    pub site_id: SiteId,
    /// Table queried for readings
    pub table: TableName,
    /// Pause between cycles
    #[serde(default = "default_sleep_time_ms")]
    pub sleep_time_ms: u64,
    /// Stop after this many cycles; unbounded when absent
    #[serde(default)]
    pub max_cycles: Option<u64>,
    /// Wait a random part of `sleep_time_ms` before the first cycle
    #[serde(default)]
    pub delay_start: bool,
    /// Percentage chance (0-100) that a cycle skips publishing
    #[serde(default)]
    pub no_send_probability: u8,
    /// Message topic; defaults to the site id
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub topic_prefix: Option<String>,
    #[serde(default)]
    pub topic_suffix: Option<String>,
    /// Datalogger identity reported in payloads
    #[serde(default)]
    pub profile: DeviceProfile,
}

impl DeviceConfig {
    pub fn new(site_id: impl Into<SiteId>, table: impl Into<TableName>) -> Self {
        Self {
            site_id: site_id.into(),
            table: table.into(),
            sleep_time_ms: default_sleep_time_ms(),
            max_cycles: None,
            delay_start: false,
            no_send_probability: 0,
            topic: None,
            topic_prefix: None,
            topic_suffix: None,
            profile: DeviceProfile::default(),
        }
    }

    pub fn with_sleep_time(mut self, sleep_time: Duration) -> Self {
        self.sleep_time_ms = sleep_time.as_millis() as u64;
        self
    }

    pub fn with_max_cycles(mut self, max_cycles: u64) -> Self {
        self.max_cycles = Some(max_cycles);
        self
    }

    pub fn with_no_send_probability(mut self, percent: u8) -> Self {
        self.no_send_probability = percent;
        self
    }

    pub fn with_topic_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.topic_prefix = Some(prefix.into());
        self
    }

    pub fn sleep_time(&self) -> Duration {
        Duration::from_millis(self.sleep_time_ms)
    }

    /// `prefix/topic/suffix`, skipping the parts that are not set
    pub fn message_topic(&self) -> String {
        let topic = self.topic.as_deref().unwrap_or(&self.site_id);
        [self.topic_prefix.as_deref(), Some(topic), self.topic_suffix.as_deref()]
            .into_iter()
            .flatten()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn validate(&self) -> IotSwarmResult<()> {
        if self.site_id.trim().is_empty() {
            return Err(IotSwarmError::config("device site_id must not be empty"));
        }
        if self.table.trim().is_empty() {
            return Err(IotSwarmError::config(format!(
                "device {}: table must not be empty",
                self.site_id
            )));
        }
        if self.no_send_probability > 100 {
            return Err(IotSwarmError::config(format!(
                "device {}: no_send_probability must be within 0..=100, got {}",
                self.site_id, self.no_send_probability
            )));
        }
        Ok(())
    }
}

/// Final account of a device run
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceReport {
    pub site_id: SiteId,
    pub state: DeviceState,
    /// Completed query/publish cycles
    pub cycles: u64,
    pub messages_sent: u64,
    /// Cycles where publishing was skipped on purpose
    pub skipped_sends: u64,
    /// Cycles where the source had no reading for the site
    pub empty_queries: u64,
    pub error: Option<IotSwarmError>,
}

enum CycleOutcome {
    Published,
    Skipped,
    NoData,
}

/// One simulated site
pub struct Device {
    config: DeviceConfig,
    source: Arc<dyn DataSource>,
    sink: Arc<dyn Sink>,
    retry: RetryPolicy,
    builder: PayloadBuilder,
    state: DeviceState,
    cycles: u64,
    messages_sent: u64,
    skipped_sends: u64,
    empty_queries: u64,
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("site_id", &self.config.site_id)
            .field("table", &self.config.table)
            .field("source", &self.source.name())
            .field("sink", &self.sink.name())
            .field("state", &self.state)
            .field("cycles", &self.cycles)
            .finish()
    }
}

impl Device {
    pub fn new(
        config: DeviceConfig,
        source: Arc<dyn DataSource>,
        sink: Arc<dyn Sink>,
        retry: RetryPolicy,
    ) -> IotSwarmResult<Self> {
        config.validate()?;
        retry.validate()?;

        let builder = PayloadBuilder::new(config.profile.clone());
        Ok(Self {
            config,
            source,
            sink,
            retry,
            builder,
            state: DeviceState::Created,
            cycles: 0,
            messages_sent: 0,
            skipped_sends: 0,
            empty_queries: 0,
        })
    }

    pub fn site_id(&self) -> &str {
        &self.config.site_id
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    fn transition(&mut self, next: DeviceState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid device transition {} -> {}",
            self.state,
            next
        );
        debug!(site_id = %self.config.site_id, from = %self.state, to = %next, "Device state change");
        self.state = next;
    }

    fn bound_reached(&self) -> bool {
        self.config
            .max_cycles
            .is_some_and(|max| self.cycles >= max)
    }

    /// Drive the device until it stops, fails or `cancel` fires
    pub async fn run(mut self, cancel: CancellationToken) -> DeviceReport {
        info!(
            site_id = %self.config.site_id,
            table = %self.config.table,
            max_cycles = ?self.config.max_cycles,
            "Device starting"
        );

        let mut failure = None;

        if self.config.delay_start && !cancel.is_cancelled() {
            let delay_ms = rand::thread_rng().gen_range(0..=self.config.sleep_time_ms);
            debug!(site_id = %self.config.site_id, delay_ms, "Delaying first cycle");
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = sleep(Duration::from_millis(delay_ms)) => {}
            }
        }

        loop {
            if cancel.is_cancelled() || self.bound_reached() {
                self.transition(DeviceState::Stopped);
                break;
            }

            self.transition(DeviceState::Running);
            match self.cycle(&cancel).await {
                Ok(outcome) => {
                    self.cycles += 1;
                    match outcome {
                        CycleOutcome::Published => self.messages_sent += 1,
                        CycleOutcome::Skipped => self.skipped_sends += 1,
                        CycleOutcome::NoData => self.empty_queries += 1,
                    }
                }
                Err(IotSwarmError::Cancelled) => {
                    self.transition(DeviceState::Stopped);
                    break;
                }
                Err(e) => {
                    error!(site_id = %self.config.site_id, cycle = self.cycles + 1, error = %e, "Device failed");
                    metrics::counter!("iotswarm_device_failures_total").increment(1);
                    self.transition(DeviceState::Failed);
                    failure = Some(e);
                    break;
                }
            }

            if self.bound_reached() {
                self.transition(DeviceState::Stopped);
                break;
            }

            self.transition(DeviceState::Sleeping);
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.transition(DeviceState::Stopped);
                    break;
                }
                _ = sleep(self.config.sleep_time()) => {}
            }
        }

        info!(
            site_id = %self.config.site_id,
            state = %self.state,
            cycles = self.cycles,
            messages_sent = self.messages_sent,
            "Device finished"
        );

        DeviceReport {
            site_id: self.config.site_id,
            state: self.state,
            cycles: self.cycles,
            messages_sent: self.messages_sent,
            skipped_sends: self.skipped_sends,
            empty_queries: self.empty_queries,
            error: failure,
        }
    }

    async fn cycle(&self, cancel: &CancellationToken) -> IotSwarmResult<CycleOutcome> {
        let table = self.config.table.as_str();
        let site_id = self.config.site_id.as_str();

        let record = self
            .retry
            .run("query", cancel, || self.source.next_reading(table, site_id))
            .await?;

        let Some(record) = record else {
            warn!(site_id, table, "No data found for site");
            return Ok(CycleOutcome::NoData);
        };

        if self.skip_send() {
            info!(site_id, "Skipped sending message");
            return Ok(CycleOutcome::Skipped);
        }

        let payload = self.builder.build(site_id, std::slice::from_ref(&record))?;
        let topic = self.config.message_topic();

        self.retry
            .run("publish", cancel, || self.sink.publish(&topic, &payload))
            .await?;

        metrics::counter!("iotswarm_messages_published_total", "mode" => "swarm").increment(1);
        info!(site_id, topic = %topic, cycle = self.cycles + 1, "Message sent");
        Ok(CycleOutcome::Published)
    }

    fn skip_send(&self) -> bool {
        self.config.no_send_probability > 0
            && rand::thread_rng().gen_range(0..100u8) < self.config.no_send_probability
    }
}
