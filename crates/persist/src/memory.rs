use retrace_common::{AttributeMap, EntityKey, Version};
use retrace_kernel::{HistoryError, HistoryStore, HistoryTx, StoredEntity, VersionRecord};
use std::collections::BTreeMap;
use tracing::trace;

/// Entity rows and version records held in memory.
#[derive(Debug, Clone, Default)]
struct MemoryState {
    entities: BTreeMap<EntityKey, StoredEntity>,
    versions: BTreeMap<EntityKey, BTreeMap<Version, VersionRecord>>,
}

impl HistoryTx for MemoryState {
    fn read_entity(&self, key: &EntityKey) -> Result<Option<StoredEntity>, HistoryError> {
        Ok(self.entities.get(key).cloned())
    }

    fn write_entity(
        &mut self,
        key: &EntityKey,
        attributes: &AttributeMap,
    ) -> Result<(), HistoryError> {
        self.entities.entry(key.clone()).or_default().attributes = attributes.clone();
        Ok(())
    }

    fn write_version_pointer(
        &mut self,
        key: &EntityKey,
        version: Version,
    ) -> Result<(), HistoryError> {
        self.entities.entry(key.clone()).or_default().version_pointer = Some(version);
        Ok(())
    }

    fn delete_entity(&mut self, key: &EntityKey) -> Result<(), HistoryError> {
        self.entities.remove(key);
        Ok(())
    }

    fn max_version(&self, key: &EntityKey) -> Result<Version, HistoryError> {
        Ok(self
            .versions
            .get(key)
            .and_then(|records| records.keys().next_back().copied())
            .unwrap_or(0))
    }

    fn versions(&self, key: &EntityKey) -> Result<Vec<VersionRecord>, HistoryError> {
        Ok(self
            .versions
            .get(key)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default())
    }

    fn insert_version(&mut self, record: &VersionRecord) -> Result<(), HistoryError> {
        let records = self.versions.entry(record.entity.clone()).or_default();
        if records.contains_key(&record.version) {
            return Err(HistoryError::VersionConflict {
                entity: record.entity.clone(),
                version: record.version,
            });
        }
        records.insert(record.version, record.clone());
        Ok(())
    }
}

/// In-memory history store.
///
/// Each transaction works on a staged copy of the whole state, which replaces
/// the committed state only when the block succeeds. `&mut self` access
/// serializes transactions; share the store behind a `Mutex` across threads.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: MemoryState,
    commits: u64,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed transactions.
    pub fn commit_count(&self) -> u64 {
        self.commits
    }

    /// Number of entities with at least one version record.
    pub fn tracked_entity_count(&self) -> usize {
        self.state.versions.len()
    }
}

impl HistoryStore for MemoryStore {
    fn atomically<T, F>(&mut self, f: F) -> Result<T, HistoryError>
    where
        F: FnOnce(&mut dyn HistoryTx) -> Result<T, HistoryError>,
    {
        let mut staged = self.state.clone();
        let out = f(&mut staged)?;
        self.state = staged;
        self.commits += 1;
        trace!(commits = self.commits, "memory store commit");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrace_kernel::ChangeKind;
    use serde_json::json;

    fn record(version: Version) -> VersionRecord {
        let mut new_values = AttributeMap::new();
        new_values.insert("status".into(), json!(format!("s{version}")));
        VersionRecord {
            entity: EntityKey::new("article", "1"),
            version,
            event: ChangeKind::Update,
            old_values: AttributeMap::new(),
            new_values,
            is_snapshot: false,
            author_id: None,
            created_at_ms: 0,
        }
    }

    #[test]
    fn versions_are_returned_in_order() {
        let mut store = MemoryStore::new();
        store
            .atomically(|tx| {
                tx.insert_version(&record(2))?;
                tx.insert_version(&record(1))?;
                tx.insert_version(&record(3))
            })
            .unwrap();

        let key = EntityKey::new("article", "1");
        let versions = store.atomically(|tx| tx.versions(&key)).unwrap();
        assert_eq!(
            versions.iter().map(|r| r.version).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(store.atomically(|tx| tx.max_version(&key)).unwrap(), 3);
        assert_eq!(store.tracked_entity_count(), 1);
    }

    #[test]
    fn duplicate_version_is_a_conflict() {
        let mut store = MemoryStore::new();
        store.atomically(|tx| tx.insert_version(&record(1))).unwrap();
        let err = store
            .atomically(|tx| tx.insert_version(&record(1)))
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn failed_block_rolls_back_every_write() {
        let mut store = MemoryStore::new();
        let key = EntityKey::new("article", "1");
        let mut attrs = AttributeMap::new();
        attrs.insert("status".into(), json!("draft"));

        let result: Result<(), HistoryError> = store.atomically(|tx| {
            tx.write_entity(&key, &attrs)?;
            tx.insert_version(&record(1))?;
            tx.insert_version(&record(1))
        });
        assert!(result.is_err());
        assert_eq!(store.commit_count(), 0);

        let (entity, max) = store
            .atomically(|tx| Ok((tx.read_entity(&key)?, tx.max_version(&key)?)))
            .unwrap();
        assert!(entity.is_none());
        assert_eq!(max, 0);
    }

    #[test]
    fn pointer_survives_attribute_writes() {
        let mut store = MemoryStore::new();
        let key = EntityKey::new("article", "1");
        store
            .atomically(|tx| {
                tx.write_version_pointer(&key, 4)?;
                tx.write_entity(&key, &AttributeMap::new())
            })
            .unwrap();
        let stored = store.atomically(|tx| tx.read_entity(&key)).unwrap().unwrap();
        assert_eq!(stored.version_pointer, Some(4));
    }
}
