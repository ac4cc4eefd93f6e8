//! Persistent `documentHash -> offset` index, behind the [`IndexStore`]
//! trait so the DCP (the writer) and the orchestrator/cache client (the
//! readers) do not import each other's concrete types.

pub mod sqlite;
pub mod store;

#[cfg(feature = "rocksdb-backend")]
pub mod rocks;

pub use sqlite::SqliteIndexStore;
pub use store::IndexStore;

#[cfg(feature = "rocksdb-backend")]
pub use rocks::RocksIndexStore;
