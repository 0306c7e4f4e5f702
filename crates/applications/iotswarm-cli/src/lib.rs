//! # IoT Swarm CLI
//!
//! Configuration loading and command implementations behind the `iotswarm`
//! binary:
//! - `simulate` runs one device per site until the cycle bound, the timeout
//!   or Ctrl-C
//! - `send-live-data` forwards readings newer than each pair's checkpoint
//! - `show-config` prints the effective configuration

pub mod commands;
pub mod config;
pub mod context;
pub mod telemetry;

pub use config::AppConfig;
pub use context::{AppContext, LiveOptions, SimulateOptions};
