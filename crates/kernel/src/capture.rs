//! Diff capture: turn a committed mutation into the contents of a version
//! record.

use crate::config::EntityPolicy;
use crate::entity::ChangeKind;
use crate::record::VersionRecord;
use retrace_common::{AttributeMap, AuthorId, EntityKey, Value, Version};
use std::collections::BTreeSet;

/// The attribute changes of one mutation, restricted to tracked attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Diff {
    pub event: ChangeKind,
    pub old_values: AttributeMap,
    pub new_values: AttributeMap,
}

/// Compute the diff of a committed mutation.
///
/// Creation and deletion record every tracked attribute. An update records
/// only the tracked attributes whose value changed; an attribute that appeared
/// or disappeared is recorded with a null on the missing side. Returns `None`
/// for an update that changed no tracked attribute.
pub fn compute_diff(
    event: ChangeKind,
    original: &AttributeMap,
    current: &AttributeMap,
    policy: &EntityPolicy,
) -> Option<Diff> {
    match event {
        ChangeKind::Create => Some(Diff {
            event,
            old_values: AttributeMap::new(),
            new_values: policy.attributes.select(current),
        }),
        ChangeKind::Destroy => Some(Diff {
            event,
            old_values: policy.attributes.select(original),
            new_values: AttributeMap::new(),
        }),
        ChangeKind::Update => {
            let names: BTreeSet<&String> = original
                .keys()
                .chain(current.keys())
                .filter(|name| policy.tracks(name))
                .collect();

            let mut old_values = AttributeMap::new();
            let mut new_values = AttributeMap::new();
            for name in names {
                let before = original.get(name).unwrap_or(&Value::Null);
                let after = current.get(name).unwrap_or(&Value::Null);
                if before != after {
                    old_values.insert(name.clone(), before.clone());
                    new_values.insert(name.clone(), after.clone());
                }
            }

            if new_values.is_empty() {
                None
            } else {
                Some(Diff {
                    event,
                    old_values,
                    new_values,
                })
            }
        }
    }
}

/// Express a mutation against `head`, the tracked state at the newest
/// version, for an entity whose stored row is behind it.
///
/// A creation keeps the full head state as `old_values` so that reversing it
/// lands back on the head. Returns `None` for an update that leaves the
/// tracked state equal to the head.
pub fn rebase(
    event: ChangeKind,
    head: &AttributeMap,
    current: &AttributeMap,
    policy: &EntityPolicy,
) -> Option<Diff> {
    match event {
        ChangeKind::Create => Some(Diff {
            event,
            old_values: policy.attributes.select(head),
            new_values: policy.attributes.select(current),
        }),
        ChangeKind::Update | ChangeKind::Destroy => compute_diff(event, head, current, policy),
    }
}

/// Assemble the record for `diff` at `version`.
///
/// When the policy makes `version` a snapshot, `new_values` is widened to the
/// full tracked attribute set of `current`, plus nulls for removed attributes.
pub fn build_record(
    entity: &EntityKey,
    version: Version,
    diff: Diff,
    current: &AttributeMap,
    policy: &EntityPolicy,
    author_id: Option<AuthorId>,
    created_at_ms: i64,
) -> VersionRecord {
    let is_snapshot = policy.is_snapshot_version(version, diff.event);
    let new_values = if is_snapshot && diff.event == ChangeKind::Update {
        // keep the nulls of removed attributes so forward application clears them
        let mut full = diff.new_values;
        full.extend(policy.attributes.select(current));
        full
    } else {
        diff.new_values
    };

    VersionRecord {
        entity: entity.clone(),
        version,
        event: diff.event,
        old_values: diff.old_values,
        new_values,
        is_snapshot,
        author_id,
        created_at_ms,
    }
}
