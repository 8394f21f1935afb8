//! History storage backends.
//!
//! # Invariants
//! - Version rows are append-only; a duplicate version is a conflict, never an overwrite.
//! - Every transaction either commits all of its writes or none.
//! - Archived histories are content-addressed and verified before use.

pub mod archive;
pub mod error;
pub mod memory;
pub mod sqlite;

pub use archive::HistoryArchive;
pub use error::StoreError;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
