//! # IoT Swarm Live
//!
//! Incremental forwarding of new readings. A [`LiveUploader`] pass visits
//! every selected (table, site) pair, publishes only records newer than the
//! pair's checkpoint and advances the checkpoint after each confirmed publish.
//! Delivery is exactly once in steady state and at least once across crashes.

#![warn(clippy::all)]

pub mod config;
pub mod report;
pub mod uploader;

pub use config::{LiveUploadConfig, Selection, DEFAULT_PERMITTED_TABLES};
pub use report::{PairOutcome, PairReport, UploadReport};
pub use uploader::LiveUploader;
