//! Concurrent execution of a set of devices

use crate::device::{Device, DeviceReport, DeviceState};
use futures::FutureExt;
use iotswarm_core::{CancellationToken, IotSwarmError, IotSwarmResult, SiteId};
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    panic::AssertUnwindSafe,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::{
    sync::Semaphore,
    task::{self, JoinError, JoinSet},
    time::sleep,
};
use tracing::{error, info, warn};
use uuid::Uuid;

/// Configuration for a swarm run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwarmConfig {
    /// Name used in logs and reports; generated when absent
    pub name: Option<String>,
    /// Cancel every device once this many seconds have passed
    pub run_timeout_secs: Option<u64>,
    /// Upper bound on devices running at once; all at once when absent
    pub max_concurrent_devices: Option<usize>,
}

impl SwarmConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }
}

/// Aggregate outcome of a swarm run
#[derive(Debug, Clone)]
pub struct SwarmReport {
    pub swarm_name: String,
    pub stopped: usize,
    pub failed: usize,
    /// Per-device reports ordered by site id
    pub devices: Vec<DeviceReport>,
    /// Terminal errors of the failed devices
    pub errors: Vec<(SiteId, IotSwarmError)>,
    pub elapsed: Duration,
    /// The run timeout fired before every device finished on its own
    pub timed_out: bool,
}

impl SwarmReport {
    pub fn all_stopped(&self) -> bool {
        self.failed == 0
    }

    pub fn messages_sent(&self) -> u64 {
        self.devices.iter().map(|d| d.messages_sent).sum()
    }
}

/// A named collection of devices run concurrently
#[derive(Debug)]
pub struct Swarm {
    name: String,
    devices: Vec<Device>,
    config: SwarmConfig,
    cancel: CancellationToken,
}

impl Swarm {
    /// Build a swarm; rejects an empty device set and duplicate sites
    pub fn create(devices: Vec<Device>, config: SwarmConfig) -> IotSwarmResult<Self> {
        if devices.is_empty() {
            return Err(IotSwarmError::config("a swarm needs at least one device"));
        }

        let mut seen = HashSet::new();
        for device in &devices {
            if !seen.insert(device.site_id().to_string()) {
                return Err(IotSwarmError::config(format!(
                    "duplicate device for site '{}'",
                    device.site_id()
                )));
            }
        }

        if config.max_concurrent_devices == Some(0) {
            return Err(IotSwarmError::config(
                "swarm.max_concurrent_devices must be at least 1",
            ));
        }

        let name = config
            .name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| format!("unnamed-swarm-{}", Uuid::new_v4()));

        Ok(Self {
            name,
            devices,
            config,
            cancel: CancellationToken::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn site_ids(&self) -> Vec<&str> {
        self.devices.iter().map(Device::site_id).collect()
    }

    /// Stop signal shared with every device of this swarm
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run every device until all reach a terminal state
    ///
    /// A failing device never stops its siblings. Cancellation, whether from
    /// the token or the run timeout, stops every device; the call returns once
    /// all of them have drained.
    pub async fn run(self) -> SwarmReport {
        let started = Instant::now();
        let Swarm {
            name,
            devices,
            config,
            cancel,
        } = self;

        info!(swarm = %name, devices = devices.len(), max_concurrent = ?config.max_concurrent_devices, "Starting swarm");

        let permits = config
            .max_concurrent_devices
            .map(|limit| Arc::new(Semaphore::new(limit)));

        let mut tasks = JoinSet::new();
        let mut sites: HashMap<task::Id, SiteId> = HashMap::new();
        for device in devices {
            let site_id = device.site_id().to_string();
            let cancel = cancel.clone();
            let permits = permits.clone();
            let handle = tasks.spawn(async move {
                let _permit = match permits {
                    Some(permits) => tokio::select! {
                        permit = permits.acquire_owned() => permit.ok(),
                        _ = cancel.cancelled() => None,
                    },
                    None => None,
                };
                run_isolated(device, cancel).await
            });
            sites.insert(handle.id(), site_id);
        }

        let deadline = config.run_timeout();
        let timer = async move {
            match deadline {
                Some(deadline) => sleep(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(timer);

        let mut timed_out = false;
        let mut reports = Vec::new();
        loop {
            tokio::select! {
                joined = tasks.join_next_with_id() => match joined {
                    Some(Ok((_, report))) => reports.push(report),
                    Some(Err(e)) => {
                        let report = abnormal_report(&sites, e);
                        error!(swarm = %name, site_id = %report.site_id, error = ?report.error, "Device task ended abnormally");
                        reports.push(report);
                    }
                    None => break,
                },
                _ = &mut timer, if !timed_out => {
                    timed_out = true;
                    warn!(swarm = %name, timeout_secs = ?config.run_timeout_secs, "Run timeout reached, stopping devices");
                    cancel.cancel();
                }
            }
        }

        reports.sort_by(|a, b| a.site_id.cmp(&b.site_id));

        let failed = reports
            .iter()
            .filter(|r| r.state == DeviceState::Failed)
            .count();
        let errors: Vec<_> = reports
            .iter()
            .filter_map(|r| r.error.clone().map(|e| (r.site_id.clone(), e)))
            .collect();
        let elapsed = started.elapsed();

        info!(
            swarm = %name,
            stopped = reports.len() - failed,
            failed,
            elapsed_ms = elapsed.as_millis() as u64,
            "Swarm finished"
        );

        SwarmReport {
            swarm_name: name,
            stopped: reports.len() - failed,
            failed,
            devices: reports,
            errors,
            elapsed,
            timed_out,
        }
    }
}

/// Run a device, turning a panic into a failed report
async fn run_isolated(device: Device, cancel: CancellationToken) -> DeviceReport {
    let site_id = device.site_id().to_string();
    match AssertUnwindSafe(device.run(cancel)).catch_unwind().await {
        Ok(report) => report,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(site_id = %site_id, panic = %message, "Device panicked");
            metrics::counter!("iotswarm_device_failures_total").increment(1);
            failed_report(site_id, IotSwarmError::internal(format!("device panicked: {message}")))
        }
    }
}

/// Failed report for a task that panicked outside the device or was aborted
fn abnormal_report(sites: &HashMap<task::Id, SiteId>, err: JoinError) -> DeviceReport {
    let site_id = sites
        .get(&err.id())
        .cloned()
        .unwrap_or_else(|| format!("<task {}>", err.id()));
    metrics::counter!("iotswarm_device_failures_total").increment(1);
    failed_report(site_id, IotSwarmError::internal(format!("device task failed: {err}")))
}

fn failed_report(site_id: SiteId, error: IotSwarmError) -> DeviceReport {
    DeviceReport {
        site_id,
        state: DeviceState::Failed,
        cycles: 0,
        messages_sent: 0,
        skipped_sends: 0,
        empty_queries: 0,
        error: Some(error),
    }
}
