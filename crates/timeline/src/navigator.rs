use retrace_common::{AttributeMap, EntityKey, Version};
use retrace_kernel::approach::Approach;
use retrace_kernel::{
    ChangeKind, EntityPolicy, GapPolicy, HistoryError, HistoryStore, History, StoredEntity,
    TrackedEntity, TrackingRegistry, VersionRecord,
};
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Which plan a navigation executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApproachKind {
    None,
    Direct,
    FromSnapshot { version: Version },
}

impl From<&Approach<'_>> for ApproachKind {
    fn from(approach: &Approach<'_>) -> Self {
        match approach {
            Approach::None => Self::None,
            Approach::Direct => Self::Direct,
            Approach::FromSnapshot(snapshot) => Self::FromSnapshot {
                version: snapshot.version,
            },
        }
    }
}

impl fmt::Display for ApproachKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::Direct => f.write_str("direct"),
            Self::FromSnapshot { version } => write!(f, "snapshot@{version}"),
        }
    }
}

/// Outcome of a committed navigation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationReport {
    pub entity: EntityKey,
    pub from: Version,
    pub to: Version,
    pub approach: ApproachKind,
    /// Versions applied, in application order. A snapshot comes first.
    pub applied: Vec<Version>,
    /// Versions absent from the history that the walk stepped over.
    pub skipped: Vec<Version>,
}

impl NavigationReport {
    /// Whether the resulting state is exactly the recorded target state.
    pub fn is_exact(&self) -> bool {
        self.skipped.is_empty()
    }

    pub fn moved(&self) -> bool {
        self.approach != ApproachKind::None
    }
}

/// Transactional rewind / fast-forward / go-to.
pub struct Navigator {
    registry: Arc<TrackingRegistry>,
}

impl Navigator {
    pub fn new(registry: Arc<TrackingRegistry>) -> Self {
        Self { registry }
    }

    /// The version the entity is considered to be at.
    ///
    /// Types with a version pointer use the stored pointer; everything else
    /// (and a pointer type whose row is gone) uses the highest recorded version.
    pub fn current_version<S: HistoryStore>(
        &self,
        store: &mut S,
        entity: &TrackedEntity,
    ) -> Result<Version, HistoryError> {
        let policy = self.registry.policy(&entity.key().entity_type)?;
        store.atomically(|tx| {
            let stored = tx.read_entity(entity.key())?;
            let max_recorded = tx.max_version(entity.key())?;
            Ok(resolve_current(policy, stored.as_ref(), max_recorded))
        })
    }

    /// All version records of `key`, ascending.
    pub fn versions<S: HistoryStore>(
        &self,
        store: &mut S,
        key: &EntityKey,
    ) -> Result<Vec<VersionRecord>, HistoryError> {
        self.registry.policy(&key.entity_type)?;
        store.atomically(|tx| tx.versions(key))
    }

    /// Move the entity to exactly version `target`; 0 is the attribute-free state.
    pub fn go_to<S: HistoryStore>(
        &self,
        store: &mut S,
        entity: &mut TrackedEntity,
        target: Version,
    ) -> Result<NavigationReport, HistoryError> {
        self.navigate(store, entity, |_| target)
    }

    /// Move back `steps` versions, stopping at 0.
    pub fn rewind<S: HistoryStore>(
        &self,
        store: &mut S,
        entity: &mut TrackedEntity,
        steps: u64,
    ) -> Result<NavigationReport, HistoryError> {
        self.navigate(store, entity, |current| current.saturating_sub(steps))
    }

    /// Move forward `steps` versions. Past the newest version this fails
    /// with `VersionNotFound`.
    pub fn fast_forward<S: HistoryStore>(
        &self,
        store: &mut S,
        entity: &mut TrackedEntity,
        steps: u64,
    ) -> Result<NavigationReport, HistoryError> {
        self.navigate(store, entity, |current| current.saturating_add(steps))
    }

    /// Resolve current, pick an approach, apply, persist. One transaction:
    /// any failure leaves both the stored row and `entity` untouched.
    ///
    /// Only a stored version pointer says which version the row holds. Without
    /// one the walk starts from the newest version, whose tracked state is
    /// rebuilt from history; the row keeps only its untracked attributes.
    fn navigate<S: HistoryStore>(
        &self,
        store: &mut S,
        entity: &mut TrackedEntity,
        target_of: impl FnOnce(Version) -> Version,
    ) -> Result<NavigationReport, HistoryError> {
        let policy = self.registry.policy(&entity.key().entity_type)?;
        let gaps = GapPolicy::from_strict(self.registry.strict_gaps());
        let key = entity.key().clone();
        let base = entity.original().clone();

        let (report, landing) = store.atomically(|tx| {
            let records = tx.versions(&key)?;
            let history = History::new(&key, &records, policy, gaps);
            let stored = tx.read_entity(&key)?;
            let current = resolve_current(policy, stored.as_ref(), history.newest());
            let anchored = policy.version_pointer
                && stored.as_ref().is_some_and(|row| row.version_pointer.is_some());
            let target = target_of(current);

            let target_record = history.record(target);
            if target != 0 && target_record.is_none() {
                return Err(HistoryError::VersionNotFound {
                    entity: key.clone(),
                    version: target,
                });
            }

            let plan = history.plan(current, target);
            let mut report = NavigationReport {
                entity: key.clone(),
                from: current,
                to: target,
                approach: ApproachKind::from(&plan),
                applied: Vec::new(),
                skipped: Vec::new(),
            };
            if matches!(plan, Approach::None) && (anchored || records.is_empty()) {
                return Ok((report, Landing::Unchanged));
            }

            let row = stored.map(|row| row.attributes).unwrap_or(base);
            let mut attributes = if anchored {
                row
            } else {
                let (head, trace) = history.state_at(current)?;
                report.skipped.extend(trace.skipped);
                let mut attributes: AttributeMap = row
                    .into_iter()
                    .filter(|(name, _)| !policy.tracks(name))
                    .collect();
                attributes.extend(head);
                attributes
            };

            let trace = history.execute(&mut attributes, plan, current, target)?;
            report.applied.extend(trace.applied);
            report.skipped.extend(trace.skipped);

            if target_record.is_some_and(|record| record.event == ChangeKind::Destroy) {
                tx.delete_entity(&key)?;
                return Ok((report, Landing::Destroyed));
            }
            tx.write_entity(&key, &attributes)?;
            if policy.version_pointer {
                tx.write_version_pointer(&key, target)?;
            }
            Ok((report, Landing::Restored(attributes)))
        })?;

        match landing {
            Landing::Unchanged => {}
            Landing::Restored(attributes) => entity.restore(attributes, report.to),
            Landing::Destroyed => entity.mark_destroyed(Some(report.to)),
        }
        info!(
            entity = %report.entity,
            from = report.from,
            to = report.to,
            approach = %report.approach,
            applied = report.applied.len(),
            skipped = report.skipped.len(),
            "navigated"
        );
        Ok(report)
    }
}

/// What a committed navigation did to the stored row.
enum Landing {
    Unchanged,
    Restored(AttributeMap),
    Destroyed,
}

fn resolve_current(
    policy: &EntityPolicy,
    stored: Option<&StoredEntity>,
    max_recorded: Version,
) -> Version {
    if policy.version_pointer {
        if let Some(pointer) = stored.and_then(|row| row.version_pointer) {
            return pointer;
        }
    }
    max_recorded
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recorder::{CaptureMode, Recorder};
    use retrace_kernel::{EntityTypeConfig, HistoryTx, Lifecycle, TrackingConfig};
    use retrace_persist::MemoryStore;
    use serde_json::json;

    fn setup(config: EntityTypeConfig, strict: bool) -> (Recorder, Navigator) {
        let registry = Arc::new(
            TrackingConfig {
                strict_gaps: strict,
                ..Default::default()
            }
            .track("article", config)
            .resolve()
            .unwrap(),
        );
        (Recorder::new(registry.clone()), Navigator::new(registry))
    }

    fn pointer() -> EntityTypeConfig {
        EntityTypeConfig {
            version_pointer: true,
            ..Default::default()
        }
    }

    fn with_history(
        recorder: &Recorder,
        store: &mut MemoryStore,
        statuses: &[&str],
    ) -> TrackedEntity {
        let mut entity = TrackedEntity::new(EntityKey::new("article", "1"));
        for status in statuses {
            entity.set("status", *status);
            recorder
                .save(store, &mut entity, CaptureMode::Enabled)
                .unwrap();
        }
        entity
    }

    #[test]
    fn go_to_current_is_a_no_op() {
        let (recorder, navigator) = setup(pointer(), false);
        let mut store = MemoryStore::new();
        let mut entity = with_history(&recorder, &mut store, &["draft", "active"]);
        let commits = store.commit_count();

        let report = navigator.go_to(&mut store, &mut entity, 2).unwrap();
        assert_eq!(report.approach, ApproachKind::None);
        assert!(!report.moved());
        assert!(report.applied.is_empty());
        assert_eq!(entity.get("status"), Some(&json!("active")));
        // only the read transaction was committed
        assert_eq!(store.commit_count(), commits + 1);
    }

    #[test]
    fn rewind_then_fast_forward_round_trips() {
        let (recorder, navigator) = setup(pointer(), false);
        let mut store = MemoryStore::new();
        let mut entity = with_history(&recorder, &mut store, &["draft", "active", "archived"]);

        let back = navigator.rewind(&mut store, &mut entity, 2).unwrap();
        assert_eq!((back.from, back.to), (3, 1));
        assert_eq!(back.approach, ApproachKind::FromSnapshot { version: 1 });
        assert_eq!(back.applied, vec![1]);
        assert_eq!(entity.get("status"), Some(&json!("draft")));
        assert_eq!(navigator.current_version(&mut store, &entity).unwrap(), 1);

        let forward = navigator.fast_forward(&mut store, &mut entity, 2).unwrap();
        assert_eq!(forward.applied, vec![2, 3]);
        assert_eq!(entity.get("status"), Some(&json!("archived")));
        assert_eq!(navigator.current_version(&mut store, &entity).unwrap(), 3);
    }

    #[test]
    fn navigation_records_no_versions() {
        let (recorder, navigator) = setup(pointer(), false);
        let mut store = MemoryStore::new();
        let mut entity = with_history(&recorder, &mut store, &["draft", "active"]);

        navigator.go_to(&mut store, &mut entity, 1).unwrap();
        let versions = navigator.versions(&mut store, entity.key()).unwrap();
        assert_eq!(versions.len(), 2);
    }

    #[test]
    fn version_zero_clears_tracked_attributes() {
        let (recorder, navigator) = setup(
            EntityTypeConfig {
                only: Some(vec!["status".into()]),
                version_pointer: true,
                ..Default::default()
            },
            false,
        );
        let mut store = MemoryStore::new();
        let mut entity = TrackedEntity::new(EntityKey::new("article", "1"));
        entity.set("status", "draft");
        entity.set("views", 3);
        recorder
            .save(&mut store, &mut entity, CaptureMode::Enabled)
            .unwrap();

        navigator.go_to(&mut store, &mut entity, 0).unwrap();
        assert_eq!(entity.get("status"), None);
        assert_eq!(entity.get("views"), Some(&json!(3)));
        assert_eq!(entity.current_version(), 0);
    }

    #[test]
    fn rewind_saturates_at_zero() {
        let (recorder, navigator) = setup(pointer(), false);
        let mut store = MemoryStore::new();
        let mut entity = with_history(&recorder, &mut store, &["draft"]);

        let report = navigator.rewind(&mut store, &mut entity, 10).unwrap();
        assert_eq!(report.to, 0);
        assert!(entity.attributes().is_empty());
    }

    #[test]
    fn fast_forward_past_newest_is_not_found() {
        let (recorder, navigator) = setup(pointer(), false);
        let mut store = MemoryStore::new();
        let mut entity = with_history(&recorder, &mut store, &["draft", "active"]);

        let err = navigator
            .fast_forward(&mut store, &mut entity, 1)
            .unwrap_err();
        assert!(matches!(
            err,
            HistoryError::VersionNotFound { version: 3, .. }
        ));
        assert_eq!(entity.get("status"), Some(&json!("active")));
    }

    #[test]
    fn untracked_type_cannot_navigate() {
        let (_, navigator) = setup(pointer(), false);
        let mut store = MemoryStore::new();
        let mut user = TrackedEntity::new(EntityKey::new("user", "1"));
        let err = navigator.go_to(&mut store, &mut user, 1).unwrap_err();
        assert!(matches!(err, HistoryError::NotTrackable { .. }));
    }

    #[test]
    fn without_pointer_current_is_newest_version() {
        let (recorder, navigator) = setup(EntityTypeConfig::default(), false);
        let mut store = MemoryStore::new();
        let mut entity = with_history(&recorder, &mut store, &["draft", "active", "archived"]);

        navigator.go_to(&mut store, &mut entity, 1).unwrap();
        assert_eq!(entity.get("status"), Some(&json!("draft")));
        // no pointer: the next navigation still starts from the newest version
        assert_eq!(navigator.current_version(&mut store, &entity).unwrap(), 3);
    }

    #[test]
    fn snapshot_shortens_the_walk() {
        let (recorder, navigator) = setup(
            EntityTypeConfig {
                version_pointer: true,
                snapshot_every: Some(5),
                ..Default::default()
            },
            false,
        );
        let mut store = MemoryStore::new();
        let statuses: Vec<String> = (1..=10).map(|i| format!("s{i}")).collect();
        let refs: Vec<&str> = statuses.iter().map(String::as_str).collect();
        let mut entity = with_history(&recorder, &mut store, &refs);

        let report = navigator.go_to(&mut store, &mut entity, 4).unwrap();
        assert_eq!(report.approach, ApproachKind::FromSnapshot { version: 5 });
        assert_eq!(report.applied, vec![5, 5]);
        assert_eq!(entity.get("status"), Some(&json!("s4")));
    }

    fn punch_gap(store: &mut MemoryStore, key: &EntityKey, keep: &[Version]) -> MemoryStore {
        // rebuild the history without the missing versions
        let records = store.atomically(|tx| tx.versions(key)).unwrap();
        let row = store.atomically(|tx| tx.read_entity(key)).unwrap().unwrap();
        let mut gapped = MemoryStore::new();
        gapped
            .atomically(|tx: &mut dyn HistoryTx| {
                tx.write_entity(key, &row.attributes)?;
                if let Some(pointer) = row.version_pointer {
                    tx.write_version_pointer(key, pointer)?;
                }
                for record in records.iter().filter(|r| keep.contains(&r.version)) {
                    tx.insert_version(record)?;
                }
                Ok(())
            })
            .unwrap();
        gapped
    }

    fn gapped_history(strict: bool) -> (Navigator, MemoryStore, TrackedEntity) {
        let (recorder, navigator) = setup(pointer(), strict);
        let mut store = MemoryStore::new();
        let mut entity = TrackedEntity::new(EntityKey::new("article", "1"));
        for (name, value) in [("title", "t1"), ("title", "t2"), ("status", "s3"), ("title", "t4")] {
            entity.set(name, value);
            recorder
                .save(&mut store, &mut entity, CaptureMode::Enabled)
                .unwrap();
        }
        let gapped = punch_gap(&mut store, entity.key(), &[1, 2, 4]);
        (navigator, gapped, entity)
    }

    #[test]
    fn gap_is_skipped_with_warning() {
        let (navigator, mut store, mut entity) = gapped_history(false);

        let report = navigator.go_to(&mut store, &mut entity, 2).unwrap();
        assert_eq!(report.approach, ApproachKind::Direct);
        assert_eq!(report.applied, vec![4]);
        assert_eq!(report.skipped, vec![3]);
        assert!(!report.is_exact());
        assert_eq!(entity.get("title"), Some(&json!("t2")));
        // the status change lived in the missing version, so it survives
        assert_eq!(entity.get("status"), Some(&json!("s3")));
    }

    #[test]
    fn strict_gap_fails_and_leaves_state() {
        let (navigator, mut store, mut entity) = gapped_history(true);

        let err = navigator.go_to(&mut store, &mut entity, 2).unwrap_err();
        assert!(matches!(err, HistoryError::HistoryGap { version: 3, .. }));

        let row = store
            .atomically(|tx| tx.read_entity(entity.key()))
            .unwrap()
            .unwrap();
        assert_eq!(row.attributes.get("title"), Some(&json!("t4")));
        assert_eq!(row.version_pointer, Some(4));
        assert_eq!(entity.get("title"), Some(&json!("t4")));
    }

    #[test]
    fn destroyed_entity_can_be_restored_from_history() {
        let (recorder, navigator) = setup(pointer(), false);
        let mut store = MemoryStore::new();
        let mut entity = with_history(&recorder, &mut store, &["draft", "archived"]);
        recorder
            .destroy(&mut store, &mut entity, CaptureMode::Enabled)
            .unwrap();
        assert_eq!(navigator.current_version(&mut store, &entity).unwrap(), 3);

        let report = navigator.go_to(&mut store, &mut entity, 2).unwrap();
        assert_eq!(report.applied, vec![3]);
        assert_eq!(entity.get("status"), Some(&json!("archived")));

        let records = navigator.versions(&mut store, entity.key()).unwrap();
        assert_eq!(records[2].event, ChangeKind::Destroy);
        let row = store
            .atomically(|tx| tx.read_entity(entity.key()))
            .unwrap()
            .unwrap();
        let mut expected = AttributeMap::new();
        expected.insert("status".into(), json!("archived"));
        assert_eq!(row.attributes, expected);
    }

    fn save_each(
        recorder: &Recorder,
        store: &mut MemoryStore,
        entity: &mut TrackedEntity,
        changes: &[(&str, &str)],
    ) {
        for (name, value) in changes {
            entity.set(*name, *value);
            recorder.save(store, entity, CaptureMode::Enabled).unwrap();
        }
    }

    #[test]
    fn edit_after_rewind_keeps_old_head_reachable() {
        let (recorder, navigator) = setup(pointer(), false);
        let mut store = MemoryStore::new();
        let mut entity = with_history(&recorder, &mut store, &["draft", "active", "archived"]);

        navigator.go_to(&mut store, &mut entity, 1).unwrap();
        entity.set("title", "hello");
        let record = recorder
            .save(&mut store, &mut entity, CaptureMode::Enabled)
            .unwrap()
            .unwrap();
        assert_eq!(record.version, 4);
        assert_eq!(record.old_values["status"], json!("archived"));
        assert_eq!(record.new_values["status"], json!("draft"));

        navigator.go_to(&mut store, &mut entity, 3).unwrap();
        assert_eq!(entity.get("status"), Some(&json!("archived")));
        assert_eq!(entity.get("title"), None);

        navigator.go_to(&mut store, &mut entity, 4).unwrap();
        assert_eq!(entity.get("status"), Some(&json!("draft")));
        assert_eq!(entity.get("title"), Some(&json!("hello")));

        navigator.go_to(&mut store, &mut entity, 2).unwrap();
        assert_eq!(entity.get("status"), Some(&json!("active")));
        assert_eq!(entity.get("title"), None);
    }

    #[test]
    fn edit_back_to_newest_state_moves_pointer_only() {
        let (recorder, navigator) = setup(pointer(), false);
        let mut store = MemoryStore::new();
        let mut entity = with_history(&recorder, &mut store, &["draft", "active", "archived"]);

        navigator.go_to(&mut store, &mut entity, 1).unwrap();
        entity.set("status", "archived");
        let record = recorder
            .save(&mut store, &mut entity, CaptureMode::Enabled)
            .unwrap();
        assert!(record.is_none());
        assert_eq!(entity.current_version(), 3);

        let row = store
            .atomically(|tx| tx.read_entity(entity.key()))
            .unwrap()
            .unwrap();
        assert_eq!(row.version_pointer, Some(3));
        assert_eq!(store.atomically(|tx| tx.max_version(entity.key())).unwrap(), 3);
    }

    #[test]
    fn without_pointer_walk_starts_from_rebuilt_newest_state() {
        let (recorder, navigator) = setup(EntityTypeConfig::default(), false);
        let mut store = MemoryStore::new();
        let mut entity = TrackedEntity::new(EntityKey::new("article", "1"));
        save_each(&recorder, &mut store, &mut entity, &[("a", "a1"), ("b", "b2"), ("a", "a3")]);

        navigator.go_to(&mut store, &mut entity, 1).unwrap();
        assert_eq!(entity.get("a"), Some(&json!("a1")));
        assert_eq!(entity.get("b"), None);

        // the row now holds v1, but nothing records that
        let report = navigator.go_to(&mut store, &mut entity, 2).unwrap();
        assert_eq!(report.from, 3);
        assert_eq!(entity.get("a"), Some(&json!("a1")));
        assert_eq!(entity.get("b"), Some(&json!("b2")));

        let report = navigator.go_to(&mut store, &mut entity, 3).unwrap();
        assert_eq!(report.approach, ApproachKind::None);
        let row = store
            .atomically(|tx| tx.read_entity(entity.key()))
            .unwrap()
            .unwrap();
        assert_eq!(row.attributes.get("a"), Some(&json!("a3")));
        assert_eq!(row.attributes.get("b"), Some(&json!("b2")));
        assert_eq!(row.version_pointer, None);
    }

    #[test]
    fn without_pointer_untracked_attributes_stay_on_the_row() {
        let (recorder, navigator) = setup(
            EntityTypeConfig {
                only: Some(vec!["status".into()]),
                ..Default::default()
            },
            false,
        );
        let mut store = MemoryStore::new();
        let mut entity = TrackedEntity::new(EntityKey::new("article", "1"));
        save_each(
            &recorder,
            &mut store,
            &mut entity,
            &[("status", "draft"), ("views", "10"), ("status", "active")],
        );

        navigator.go_to(&mut store, &mut entity, 1).unwrap();
        assert_eq!(entity.get("status"), Some(&json!("draft")));
        assert_eq!(entity.get("views"), Some(&json!("10")));
    }

    #[test]
    fn go_to_destroy_version_deletes_row() {
        let (recorder, navigator) = setup(pointer(), false);
        let mut store = MemoryStore::new();
        let mut entity = with_history(&recorder, &mut store, &["draft", "active"]);
        recorder
            .destroy(&mut store, &mut entity, CaptureMode::Enabled)
            .unwrap();

        navigator.go_to(&mut store, &mut entity, 1).unwrap();
        assert_eq!(entity.lifecycle(), Lifecycle::Persisted);
        assert_eq!(entity.get("status"), Some(&json!("draft")));

        let report = navigator.go_to(&mut store, &mut entity, 3).unwrap();
        assert_eq!(report.applied, vec![2, 3]);
        assert_eq!(entity.lifecycle(), Lifecycle::Destroyed);
        assert!(entity.attributes().is_empty());
        assert_eq!(entity.current_version(), 3);
        assert!(store
            .atomically(|tx| tx.read_entity(entity.key()))
            .unwrap()
            .is_none());

        // saving again recreates the entity on top of the deletion
        entity.set("status", "revived");
        let record = recorder
            .save(&mut store, &mut entity, CaptureMode::Enabled)
            .unwrap()
            .unwrap();
        assert_eq!(record.version, 4);
        assert_eq!(record.event, ChangeKind::Create);
        assert!(record.old_values.is_empty());
    }
}
