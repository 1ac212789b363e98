//! # SalesRelay Store
//!
//! Where transaction records live, and the read-only aggregation over them.
//!
//! - `SqliteRecordStore`: durable store (rusqlite, bundled)
//! - `MemoryRecordStore`: in-process store for tests and dry runs
//! - `Aggregator`: windowed total amount + all-time quantity per item

pub mod aggregator;
pub mod memory;
pub mod sqlite;

pub use aggregator::Aggregator;
pub use memory::MemoryRecordStore;
pub use sqlite::SqliteRecordStore;
