//! Materializing versions: running an approach plan over an attribute map.

use crate::apply::{apply, apply_snapshot};
use crate::approach::{self, Approach};
use crate::config::EntityPolicy;
use crate::error::HistoryError;
use crate::record::VersionRecord;
use retrace_common::{AttributeMap, EntityKey, Version};
use tracing::warn;

/// What to do with a version missing from the middle of a walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GapPolicy {
    /// Step over it with a warning; the result may match no recorded state.
    Skip,
    /// Fail with `HistoryError::HistoryGap`.
    Fail,
}

impl GapPolicy {
    pub fn from_strict(strict: bool) -> Self {
        if strict { Self::Fail } else { Self::Skip }
    }
}

/// Versions a replay applied and stepped over, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trace {
    pub applied: Vec<Version>,
    pub skipped: Vec<Version>,
}

/// The recorded history of one entity, ascending by version.
#[derive(Debug, Clone, Copy)]
pub struct History<'a> {
    key: &'a EntityKey,
    records: &'a [VersionRecord],
    policy: &'a EntityPolicy,
    gaps: GapPolicy,
}

impl<'a> History<'a> {
    pub fn new(
        key: &'a EntityKey,
        records: &'a [VersionRecord],
        policy: &'a EntityPolicy,
        gaps: GapPolicy,
    ) -> Self {
        Self {
            key,
            records,
            policy,
            gaps,
        }
    }

    pub fn record(&self, version: Version) -> Option<&'a VersionRecord> {
        self.records
            .binary_search_by_key(&version, |record| record.version)
            .ok()
            .map(|index| &self.records[index])
    }

    /// Highest recorded version, or 0.
    pub fn newest(&self) -> Version {
        self.records.last().map_or(0, |record| record.version)
    }

    pub fn plan(&self, current: Version, target: Version) -> Approach<'a> {
        approach::choose(current, target, self.records)
    }

    /// Move `attributes` from `current` to `target` along `plan`.
    pub fn execute(
        &self,
        attributes: &mut AttributeMap,
        plan: Approach<'_>,
        current: Version,
        target: Version,
    ) -> Result<Trace, HistoryError> {
        let mut trace = Trace::default();
        if let Approach::FromSnapshot(snapshot) = plan {
            apply_snapshot(attributes, snapshot, self.policy);
            trace.applied.push(snapshot.version);
        }

        for step in approach::walk(plan.walk_origin(current), target) {
            match (self.record(step.version), self.gaps) {
                (Some(record), _) => {
                    apply(attributes, record, step.direction);
                    trace.applied.push(step.version);
                }
                (None, GapPolicy::Fail) => {
                    return Err(HistoryError::HistoryGap {
                        entity: self.key.clone(),
                        version: step.version,
                    });
                }
                (None, GapPolicy::Skip) => {
                    warn!(
                        entity = %self.key,
                        version = step.version,
                        "version missing from history; skipped"
                    );
                    trace.skipped.push(step.version);
                }
            }
        }
        Ok(trace)
    }

    /// Tracked state at `version`, rebuilt from the records alone.
    pub fn state_at(&self, version: Version) -> Result<(AttributeMap, Trace), HistoryError> {
        let mut attributes = AttributeMap::new();
        let plan = self.plan(0, version);
        let trace = self.execute(&mut attributes, plan, 0, version)?;
        Ok((attributes, trace))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AttributeSelection;
    use crate::entity::ChangeKind;
    use retrace_common::{EntityType, Value};
    use serde_json::json;

    fn policy() -> EntityPolicy {
        EntityPolicy {
            entity_type: EntityType::new("article"),
            attributes: AttributeSelection::All,
            version_pointer: false,
            snapshot_every: None,
        }
    }

    fn record(version: Version, event: ChangeKind, old: Value, new: Value) -> VersionRecord {
        let map = |value: Value| -> AttributeMap {
            match value {
                Value::Object(fields) => fields.into_iter().collect(),
                _ => AttributeMap::new(),
            }
        };
        VersionRecord {
            entity: EntityKey::new("article", "1"),
            version,
            event,
            old_values: map(old),
            new_values: map(new),
            is_snapshot: event == ChangeKind::Create,
            author_id: None,
            created_at_ms: 0,
        }
    }

    fn records() -> Vec<VersionRecord> {
        vec![
            record(1, ChangeKind::Create, json!({}), json!({"status": "draft"})),
            record(
                2,
                ChangeKind::Update,
                json!({"title": null}),
                json!({"title": "T"}),
            ),
            record(
                3,
                ChangeKind::Update,
                json!({"status": "draft"}),
                json!({"status": "active"}),
            ),
        ]
    }

    #[test]
    fn state_at_rebuilds_each_version() {
        let key = EntityKey::new("article", "1");
        let records = records();
        let policy = policy();
        let history = History::new(&key, &records, &policy, GapPolicy::Fail);

        assert!(history.state_at(0).unwrap().0.is_empty());
        let (v2, _) = history.state_at(2).unwrap();
        assert_eq!(v2["status"], json!("draft"));
        assert_eq!(v2["title"], json!("T"));
        let (v3, trace) = history.state_at(3).unwrap();
        assert_eq!(v3["status"], json!("active"));
        assert!(trace.skipped.is_empty());
        assert_eq!(history.newest(), 3);
    }

    #[test]
    fn gaps_follow_policy() {
        let key = EntityKey::new("article", "1");
        let mut records = records();
        records.remove(1);
        let policy = policy();

        let lenient = History::new(&key, &records, &policy, GapPolicy::Skip);
        let (state, trace) = lenient.state_at(3).unwrap();
        assert_eq!(trace.skipped, vec![2]);
        assert!(!state.contains_key("title"));

        let strict = History::new(&key, &records, &policy, GapPolicy::Fail);
        let err = strict.state_at(3).unwrap_err();
        assert!(matches!(err, HistoryError::HistoryGap { version: 2, .. }));
    }
}
