//! Diff application onto an in-memory attribute map.
//!
//! # Invariants
//! - Applying never persists anything.
//! - A null value removes the attribute, so reverse-applying an attribute
//!   that first appeared in a version leaves it absent again.
//! - A creation replaces the tracked state it recorded in `old_values`
//!   (empty unless the entity was recreated behind its newest version).

use crate::config::EntityPolicy;
use crate::entity::ChangeKind;
use crate::record::VersionRecord;
use retrace_common::{AttributeMap, Value};
use tracing::debug;

/// Direction of a single diff application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Towards higher versions: apply `new_values`.
    Forward,
    /// Towards lower versions: apply `old_values`.
    Reverse,
}

/// Apply `record` in `direction`.
pub fn apply(attributes: &mut AttributeMap, record: &VersionRecord, direction: Direction) {
    match direction {
        Direction::Forward => apply_forward(attributes, record),
        Direction::Reverse => apply_reverse(attributes, record),
    }
}

/// Move from the state before `record` to the state it produced.
pub fn apply_forward(attributes: &mut AttributeMap, record: &VersionRecord) {
    debug!(entity = %record.entity, version = record.version, "apply forward");
    match record.event {
        ChangeKind::Destroy => {
            clear(attributes, &record.old_values);
            return;
        }
        ChangeKind::Create => clear(attributes, &record.old_values),
        ChangeKind::Update => {}
    }
    for (name, value) in &record.new_values {
        assign(attributes, name, value);
    }
}

/// Move from the state `record` produced to the state before it.
pub fn apply_reverse(attributes: &mut AttributeMap, record: &VersionRecord) {
    debug!(entity = %record.entity, version = record.version, "apply reverse");
    if record.event == ChangeKind::Create {
        clear(attributes, &record.new_values);
    }
    for (name, value) in &record.old_values {
        assign(attributes, name, value);
    }
}

/// Overwrite every tracked attribute with the snapshot's full state.
///
/// Tracked attributes the snapshot does not mention did not exist at that
/// version and are removed. Untracked attributes are left untouched.
pub fn apply_snapshot(attributes: &mut AttributeMap, snapshot: &VersionRecord, policy: &EntityPolicy) {
    debug!(entity = %snapshot.entity, version = snapshot.version, "apply snapshot");
    attributes.retain(|name, _| !policy.tracks(name) || snapshot.new_values.contains_key(name));
    for (name, value) in &snapshot.new_values {
        assign(attributes, name, value);
    }
}

fn clear(attributes: &mut AttributeMap, names: &AttributeMap) {
    for name in names.keys() {
        attributes.remove(name);
    }
}

fn assign(attributes: &mut AttributeMap, name: &str, value: &Value) {
    if value.is_null() {
        attributes.remove(name);
    } else {
        attributes.insert(name.to_string(), value.clone());
    }
}
