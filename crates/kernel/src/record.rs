use crate::entity::ChangeKind;
use retrace_common::{AttributeMap, AuthorId, EntityKey, Version};
use serde::{Deserialize, Serialize};

/// One immutable entry of an entity's history.
///
/// For a diff, `old_values` and `new_values` hold only the attributes that
/// changed in this version. For a snapshot, `new_values` holds the complete
/// tracked attribute set at this version while `old_values` still holds the
/// changed attributes' previous values, so the record stays reversible.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub entity: EntityKey,
    /// Unique and contiguous per entity, starting at 1.
    pub version: Version,
    pub event: ChangeKind,
    pub old_values: AttributeMap,
    pub new_values: AttributeMap,
    pub is_snapshot: bool,
    pub author_id: Option<AuthorId>,
    /// Wall-clock capture time. Informational only; ordering is by version.
    pub created_at_ms: i64,
}

impl VersionRecord {
    /// Names of the attributes this version changed.
    pub fn changed_attributes(&self) -> Vec<&str> {
        match self.event {
            ChangeKind::Update if !self.is_snapshot => {
                self.new_values.keys().map(String::as_str).collect()
            }
            ChangeKind::Create => self.new_values.keys().map(String::as_str).collect(),
            _ => self.old_values.keys().map(String::as_str).collect(),
        }
    }
}
