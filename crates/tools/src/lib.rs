//! Developer tooling: history inspection for the CLI and debugging.
//!
//! # Invariants
//! - Tools only read history; nothing here writes a record.

pub mod inspector;

pub use inspector::{HistoryInspector, HistorySummary, VersionLine};
