//! # IoT Swarm Core
//!
//! Shared building blocks for the IoT swarm crates.
//!
//! ## Features
//!
//! - **Error Handling**: one error taxonomy with retry classification
//! - **Capabilities**: [`DataSource`] and [`Sink`] traits with a closed set of
//!   implementations in [`sources`] and [`sinks`]
//! - **Retry**: bounded exponential backoff with per-attempt timeouts
//! - **Payloads**: the CR1000X datalogger message format
//!
//! ## Quick Start
//!
//! ```rust
//! use iotswarm_core::{MemoryDataSource, DataSource};
//!
//! # tokio_test::block_on(async {
//! let source = MemoryDataSource::new();
//! assert!(source.list_sites("level_1").await.unwrap().is_empty());
//! # });
//! ```

#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod payload;
pub mod retry;
pub mod sinks;
pub mod sources;
pub mod traits;
pub mod types;

// Re-export commonly used items
pub use error::{IotSwarmError, IotSwarmResult};
pub use payload::{DeviceProfile, Payload, PayloadBuilder, XsdType};
pub use retry::RetryPolicy;
pub use sinks::{FileSink, LogSink, MemorySink, PublishedMessage};
pub use sources::{MemoryDataSource, SqliteDataSource};
pub use traits::{DataSource, Sink};
pub use types::{Record, SiteId, TableName};

/// Cancellation signal shared by a swarm or an upload run
pub use tokio_util::sync::CancellationToken;

/// Version information for the IoT swarm libraries
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
