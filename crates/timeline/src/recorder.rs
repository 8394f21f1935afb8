use retrace_common::{AttributeMap, AuthorId, EntityKey, Version};
use retrace_kernel::capture::{build_record, compute_diff, rebase};
use retrace_kernel::{
    ChangeKind, EntityPolicy, GapPolicy, HistoryError, HistoryStore, HistoryTx, History,
    TrackedEntity, TrackingRegistry, VersionRecord,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// Resolves the identity of the acting user at capture time.
pub trait AuthorResolver: Send + Sync {
    fn current_author(&self) -> Option<AuthorId>;
}

impl<F> AuthorResolver for F
where
    F: Fn() -> Option<AuthorId> + Send + Sync,
{
    fn current_author(&self) -> Option<AuthorId> {
        self()
    }
}

/// Whether a write produces history.
///
/// Threaded explicitly through the write path so that replaying history, or
/// any other bulk write, can opt out of capture for exactly the writes it makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CaptureMode {
    #[default]
    Enabled,
    Suppressed,
}

/// Diff capture: writes one version record per committed mutation.
pub struct Recorder {
    registry: Arc<TrackingRegistry>,
    author: Option<Box<dyn AuthorResolver>>,
}

impl Recorder {
    pub fn new(registry: Arc<TrackingRegistry>) -> Self {
        Self {
            registry,
            author: None,
        }
    }

    /// Attach the identity resolver used when the registry records authors.
    pub fn with_author_resolver(mut self, resolver: impl AuthorResolver + 'static) -> Self {
        self.author = Some(Box::new(resolver));
        self
    }

    pub fn registry(&self) -> &TrackingRegistry {
        &self.registry
    }

    /// Capture hook, run inside the transaction that wrote the entity.
    ///
    /// Assigns `max(version) + 1`, inserts the record and moves the entity's
    /// version pointer when its type has one. Returns `None` when capture is
    /// suppressed or the write changed no tracked attribute.
    ///
    /// A record always describes the step from the newest version to the
    /// written state. When the row was navigated behind the newest version,
    /// the diff is taken against the rebuilt head state instead of `original`.
    pub fn record_version(
        &self,
        tx: &mut dyn HistoryTx,
        key: &EntityKey,
        event: ChangeKind,
        original: &AttributeMap,
        current: &AttributeMap,
        mode: CaptureMode,
    ) -> Result<Option<VersionRecord>, HistoryError> {
        Ok(self
            .capture(tx, key, event, original, current, mode)?
            .record)
    }

    fn capture(
        &self,
        tx: &mut dyn HistoryTx,
        key: &EntityKey,
        event: ChangeKind,
        original: &AttributeMap,
        current: &AttributeMap,
        mode: CaptureMode,
    ) -> Result<Captured, HistoryError> {
        let policy = self.registry.policy(&key.entity_type)?;
        if mode == CaptureMode::Suppressed {
            debug!(entity = %key, %event, "capture suppressed");
            return Ok(Captured::default());
        }

        let Some(diff) = compute_diff(event, original, current, policy) else {
            debug!(entity = %key, "no tracked attribute changed; nothing recorded");
            return Ok(Captured::default());
        };

        let newest = tx.max_version(key)?;
        let diff = if newest > 0 && !at_head(tx, key, policy, event, newest)? {
            let records = tx.versions(key)?;
            let gaps = GapPolicy::from_strict(self.registry.strict_gaps());
            let (head, _) = History::new(key, &records, policy, gaps).state_at(newest)?;
            match rebase(event, &head, current, policy) {
                Some(diff) => diff,
                None => {
                    // the write brought the row back to the newest version
                    debug!(entity = %key, version = newest, "write matches newest version");
                    if policy.version_pointer {
                        tx.write_version_pointer(key, newest)?;
                        return Ok(Captured {
                            record: None,
                            pointer: Some(newest),
                        });
                    }
                    return Ok(Captured::default());
                }
            }
        } else {
            diff
        };

        let version = newest + 1;
        let record = build_record(
            key,
            version,
            diff,
            current,
            policy,
            self.resolve_author(),
            now_ms(),
        );
        tx.insert_version(&record)?;

        // Direct pointer write: it goes around this hook, so it cannot recurse.
        let pointer = (policy.version_pointer && event != ChangeKind::Destroy).then_some(version);
        if let Some(pointer) = pointer {
            tx.write_version_pointer(key, pointer)?;
        }

        debug!(
            entity = %key,
            version,
            %event,
            snapshot = record.is_snapshot,
            changed = record.old_values.len().max(record.new_values.len()),
            "version recorded"
        );
        Ok(Captured {
            record: Some(record),
            pointer,
        })
    }

    /// Persist the entity's attributes and capture the change atomically.
    ///
    /// An unsaved (or destroyed) entity is created; a persisted one is
    /// updated. Saving a clean persisted entity writes nothing.
    pub fn save<S: HistoryStore>(
        &self,
        store: &mut S,
        entity: &mut TrackedEntity,
        mode: CaptureMode,
    ) -> Result<Option<VersionRecord>, HistoryError> {
        self.registry.policy(&entity.key().entity_type)?;
        let event = if entity.is_persisted() {
            ChangeKind::Update
        } else {
            ChangeKind::Create
        };
        if event == ChangeKind::Update && !entity.is_dirty() {
            return Ok(None);
        }

        let captured = store.atomically(|tx| {
            tx.write_entity(entity.key(), entity.attributes())?;
            self.capture(
                tx,
                entity.key(),
                event,
                entity.original(),
                entity.attributes(),
                mode,
            )
        })?;

        entity.mark_persisted(captured.pointer);
        Ok(captured.record)
    }

    /// Delete the entity's row and capture the deletion atomically.
    pub fn destroy<S: HistoryStore>(
        &self,
        store: &mut S,
        entity: &mut TrackedEntity,
        mode: CaptureMode,
    ) -> Result<Option<VersionRecord>, HistoryError> {
        self.registry.policy(&entity.key().entity_type)?;
        if !entity.is_persisted() {
            return Ok(None);
        }

        let empty = AttributeMap::new();
        let record = store.atomically(|tx| {
            // capture first: it reads the pointer stored on the row
            let record = self.record_version(
                tx,
                entity.key(),
                ChangeKind::Destroy,
                entity.original(),
                &empty,
                mode,
            )?;
            tx.delete_entity(entity.key())?;
            Ok(record)
        })?;

        entity.mark_destroyed(record.as_ref().map(|record| record.version));
        Ok(record)
    }

    fn resolve_author(&self) -> Option<AuthorId> {
        if !self.registry.author().record {
            return None;
        }
        self.author.as_ref().and_then(|resolver| resolver.current_author())
    }
}

#[derive(Debug, Default)]
struct Captured {
    record: Option<VersionRecord>,
    /// New value of the version pointer, when it moved.
    pointer: Option<Version>,
}

/// Whether the stored row is known to sit at the newest version.
///
/// Only a version pointer can tell; a creation has no row to ask.
fn at_head(
    tx: &dyn HistoryTx,
    key: &EntityKey,
    policy: &EntityPolicy,
    event: ChangeKind,
    newest: Version,
) -> Result<bool, HistoryError> {
    if event == ChangeKind::Create || !policy.version_pointer {
        return Ok(false);
    }
    let pointer = tx.read_entity(key)?.and_then(|row| row.version_pointer);
    Ok(pointer == Some(newest))
}

/// Load an entity from the store, or a fresh unsaved one if it has no row.
pub fn load_entity<S: HistoryStore>(
    store: &mut S,
    key: EntityKey,
) -> Result<TrackedEntity, HistoryError> {
    let stored = store.atomically(|tx| tx.read_entity(&key))?;
    Ok(match stored {
        Some(row) => {
            TrackedEntity::persisted(key, row.attributes, row.version_pointer.unwrap_or(0))
        }
        None => TrackedEntity::new(key),
    })
}

/// Re-run `op` while it fails with a retryable error, up to `attempts` times.
pub fn retry_on_conflict<T>(
    attempts: usize,
    mut op: impl FnMut() -> Result<T, HistoryError>,
) -> Result<T, HistoryError> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Err(err) if err.is_retryable() && attempt < attempts => {
                warn!(attempt, %err, "retrying after version conflict");
                attempt += 1;
            }
            result => return result,
        }
    }
}

fn now_ms() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration,
        Err(_) => return 0,
    };

    i64::try_from(now.as_millis()).unwrap_or(i64::MAX)
}
