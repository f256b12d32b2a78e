//! tonindex-storage — backends implementing `BatchWriter` and `CheckpointStore`.
//!
//! Backends:
//! - [`memory`] — in-memory (dev/testing, no persistence, failure injection)
//! - [`sqlite`] — SQLite via `sqlx` (embedded, single-file persistence)

pub mod error;
pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use error::StoreError;
pub use memory::MemoryStore;

#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
