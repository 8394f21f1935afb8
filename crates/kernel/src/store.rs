//! The storage seam.
//!
//! The host persistence layer is reached only through these traits. All
//! multi-step writes run inside [`HistoryStore::atomically`]: either every
//! write of the closure becomes visible or none does.

use crate::error::HistoryError;
use crate::record::VersionRecord;
use retrace_common::{AttributeMap, EntityKey, Version};

/// The stored row of a tracked entity.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredEntity {
    pub attributes: AttributeMap,
    /// Value of the current-version pointer field, if it was ever written.
    pub version_pointer: Option<Version>,
}

/// Operations available inside one transaction.
pub trait HistoryTx {
    fn read_entity(&self, key: &EntityKey) -> Result<Option<StoredEntity>, HistoryError>;

    /// Insert or replace the entity's attributes. The pointer is kept.
    fn write_entity(&mut self, key: &EntityKey, attributes: &AttributeMap)
    -> Result<(), HistoryError>;

    /// Set the current-version pointer. Never triggers capture.
    fn write_version_pointer(&mut self, key: &EntityKey, version: Version)
    -> Result<(), HistoryError>;

    fn delete_entity(&mut self, key: &EntityKey) -> Result<(), HistoryError>;

    /// Highest recorded version, or 0 when there is no history.
    fn max_version(&self, key: &EntityKey) -> Result<Version, HistoryError>;

    /// Every record of the entity, ascending by version.
    fn versions(&self, key: &EntityKey) -> Result<Vec<VersionRecord>, HistoryError>;

    /// Append a record. A record already holding that version is a
    /// `VersionConflict`, never an overwrite.
    fn insert_version(&mut self, record: &VersionRecord) -> Result<(), HistoryError>;
}

/// A store that can run a block of writes atomically.
///
/// Implementations must exclude concurrent writers for the duration of the
/// block, so that a block reading the version set sees it unchanged until it
/// commits.
pub trait HistoryStore {
    /// Run `f` in a transaction. Commits when `f` returns `Ok`, rolls back
    /// otherwise.
    fn atomically<T, F>(&mut self, f: F) -> Result<T, HistoryError>
    where
        F: FnOnce(&mut dyn HistoryTx) -> Result<T, HistoryError>;
}
