//! Data source implementations

pub mod memory;
pub mod sqlite;

pub use memory::MemoryDataSource;
pub use sqlite::SqliteDataSource;
