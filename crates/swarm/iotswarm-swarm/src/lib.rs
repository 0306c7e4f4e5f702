//! # IoT Swarm
//!
//! Simulated telemetry devices for load-testing ingestion pipelines. Each
//! [`Device`] loops query, publish, sleep for one site; a [`Swarm`] runs many
//! of them on the tokio runtime and isolates their failures.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use iotswarm_core::{LogSink, MemoryDataSource, RetryPolicy};
//! use iotswarm_swarm::{Device, DeviceConfig, Swarm, SwarmConfig};
//!
//! # async fn example() -> iotswarm_core::IotSwarmResult<()> {
//! let source = Arc::new(MemoryDataSource::new());
//! let sink = Arc::new(LogSink::new());
//! let device = Device::new(
//!     DeviceConfig::new("ALIC1", "level_1").with_max_cycles(3),
//!     source,
//!     sink,
//!     RetryPolicy::default(),
//! )?;
//!
//! let report = Swarm::create(vec![device], SwarmConfig::named("demo"))?.run().await;
//! println!("{} stopped, {} failed", report.stopped, report.failed);
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod device;
pub mod swarm;

pub use device::{Device, DeviceConfig, DeviceReport, DeviceState};
pub use swarm::{Swarm, SwarmConfig, SwarmReport};
