//! History kernel: version records, diff capture, diff application and the
//! approach engine that picks the cheapest path between versions.
//!
//! # Invariants
//! - Version numbers per entity are contiguous and start at 1.
//! - Records are append-only; nothing here mutates or deletes one.
//! - Planning is pure; only the store seam performs writes.

pub mod apply;
pub mod approach;
pub mod capture;
pub mod config;
pub mod entity;
pub mod error;
pub mod record;
pub mod replay;
pub mod store;

pub use apply::Direction;
pub use approach::Approach;
pub use config::{
    AttributeSelection, AuthorPolicy, EntityPolicy, EntityTypeConfig, TrackingConfig,
    TrackingRegistry,
};
pub use entity::{ChangeKind, Lifecycle, TrackedEntity};
pub use error::HistoryError;
pub use record::VersionRecord;
pub use replay::{GapPolicy, History, Trace};
pub use store::{HistoryStore, HistoryTx, StoredEntity};
