//! Sink implementations

pub mod file;
pub mod log;
pub mod memory;

pub use file::FileSink;
pub use log::LogSink;
pub use memory::{MemorySink, PublishedMessage};
