//! # IoT Swarm State
//!
//! Durable checkpoints for the live uploader: one timestamp per
//! (table, site) pair recording the newest reading already forwarded.
//!
//! ```rust,no_run
//! use iotswarm_state::CheckpointStore;
//!
//! # async fn example() -> iotswarm_core::IotSwarmResult<()> {
//! let store = CheckpointStore::open("/var/lib/iotswarm", "live").await?;
//! store.update("level_1", "ALIC1", chrono::Utc::now()).await?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod codec;
pub mod snapshot;
pub mod store;

pub use snapshot::{CheckpointRecord, Snapshot, UpdateOutcome};
pub use store::{CheckpointStore, StatePaths};
