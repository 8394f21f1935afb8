//! Tracking policy: which entity types are versioned and which of their
//! attributes are recorded.
//!
//! A [`TrackingConfig`] is plain data (usually loaded from YAML). It is
//! validated once and resolved into a [`TrackingRegistry`] that capture and
//! navigation consult; nothing reads policy from global state.

use crate::entity::ChangeKind;
use crate::error::HistoryError;
use retrace_common::{AttributeMap, EntityType, Version};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::num::NonZeroU64;
use std::path::Path;

const DEFAULT_AUTHOR_FIELD: &str = "author_id";

/// Column/field names the storage layer already uses for version rows.
const RESERVED_FIELDS: &[&str] = &[
    "entity_type",
    "entity_id",
    "version",
    "event",
    "old_values_json",
    "new_values_json",
    "is_snapshot",
    "created_at_ms",
];

fn default_author_field() -> String {
    DEFAULT_AUTHOR_FIELD.to_string()
}

/// Raw tracking configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrackingConfig {
    /// Global default for types that declare neither `only` nor `track_all`.
    /// `None` tracks every attribute.
    #[serde(default)]
    pub default_attributes: Option<Vec<String>>,
    /// Record the acting user on each version.
    #[serde(default)]
    pub record_author: bool,
    /// Field used to store the acting user's identity.
    #[serde(default = "default_author_field")]
    pub author_field: String,
    /// Fail navigation on a missing intermediate version instead of skipping it.
    #[serde(default)]
    pub strict_gaps: bool,
    #[serde(default)]
    pub entity_types: BTreeMap<String, EntityTypeConfig>,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            default_attributes: None,
            record_author: false,
            author_field: default_author_field(),
            strict_gaps: false,
            entity_types: BTreeMap::new(),
        }
    }
}

/// Per entity type settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntityTypeConfig {
    /// Explicit allow-list of tracked attributes.
    #[serde(default)]
    pub only: Option<Vec<String>>,
    /// Track every attribute regardless of the global default.
    #[serde(default)]
    pub track_all: bool,
    /// The entity's backing store has a current-version pointer field.
    #[serde(default)]
    pub version_pointer: bool,
    /// Make every Nth version a full-state snapshot.
    #[serde(default)]
    pub snapshot_every: Option<u64>,
}

impl TrackingConfig {
    /// Parse a YAML document.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, HistoryError> {
        serde_yaml::from_str(yaml)
            .map_err(|e| HistoryError::InvalidConfiguration(format!("YAML: {e}")))
    }

    /// Read and parse a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, HistoryError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            HistoryError::InvalidConfiguration(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_yaml_str(&text)
    }

    /// Register an entity type.
    pub fn track(mut self, entity_type: impl Into<String>, config: EntityTypeConfig) -> Self {
        self.entity_types.insert(entity_type.into(), config);
        self
    }

    /// Validate and resolve into the registry consulted at record time.
    pub fn resolve(&self) -> Result<TrackingRegistry, HistoryError> {
        let default = match &self.default_attributes {
            Some(names) => AttributeSelection::only(names, "default_attributes")?,
            None => AttributeSelection::All,
        };

        if self.record_author && !is_valid_identifier(&self.author_field) {
            return Err(HistoryError::InvalidConfiguration(format!(
                "author_field `{}` is not a valid identifier",
                self.author_field
            )));
        }
        if self.record_author && RESERVED_FIELDS.contains(&self.author_field.as_str()) {
            return Err(HistoryError::InvalidConfiguration(format!(
                "author_field `{}` clashes with a built-in version field",
                self.author_field
            )));
        }

        let mut types = BTreeMap::new();
        for (name, config) in &self.entity_types {
            if name.trim().is_empty() {
                return Err(HistoryError::InvalidConfiguration(
                    "entity type names must not be empty".into(),
                ));
            }
            let attributes = match (&config.only, config.track_all) {
                (Some(_), true) => {
                    return Err(HistoryError::InvalidConfiguration(format!(
                        "`{name}` sets both `only` and `track_all`"
                    )));
                }
                (Some(names), false) => AttributeSelection::only(names, name)?,
                (None, true) => AttributeSelection::All,
                (None, false) => default.clone(),
            };
            let snapshot_every = match config.snapshot_every {
                None => None,
                Some(n) => Some(NonZeroU64::new(n).ok_or_else(|| {
                    HistoryError::InvalidConfiguration(format!(
                        "`{name}` has snapshot_every: 0"
                    ))
                })?),
            };
            let entity_type = EntityType::new(name.clone());
            types.insert(
                entity_type.clone(),
                EntityPolicy {
                    entity_type,
                    attributes,
                    version_pointer: config.version_pointer,
                    snapshot_every,
                },
            );
        }

        Ok(TrackingRegistry {
            types,
            author: AuthorPolicy {
                record: self.record_author,
                field: self.author_field.clone(),
            },
            strict_gaps: self.strict_gaps,
        })
    }
}

/// Which attributes of an entity type are recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeSelection {
    All,
    Only(BTreeSet<String>),
}

impl AttributeSelection {
    fn only(names: &[String], context: &str) -> Result<Self, HistoryError> {
        if names.is_empty() {
            return Err(HistoryError::InvalidConfiguration(format!(
                "`{context}` has an empty attribute list"
            )));
        }
        let mut set = BTreeSet::new();
        for name in names {
            if name.trim().is_empty() {
                return Err(HistoryError::InvalidConfiguration(format!(
                    "`{context}` lists an empty attribute name"
                )));
            }
            set.insert(name.clone());
        }
        Ok(Self::Only(set))
    }

    pub fn tracks(&self, attribute: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(names) => names.contains(attribute),
        }
    }

    /// The tracked subset of `attributes`.
    pub fn select(&self, attributes: &AttributeMap) -> AttributeMap {
        attributes
            .iter()
            .filter(|(name, _)| self.tracks(name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect()
    }
}

/// Resolved settings for one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityPolicy {
    pub entity_type: EntityType,
    pub attributes: AttributeSelection,
    pub version_pointer: bool,
    pub snapshot_every: Option<NonZeroU64>,
}

impl EntityPolicy {
    pub fn tracks(&self, attribute: &str) -> bool {
        self.attributes.tracks(attribute)
    }

    /// Whether a freshly captured `version` is stored as a full snapshot.
    ///
    /// The creation version always is, since it already carries every tracked
    /// attribute. A destroy version never is.
    pub fn is_snapshot_version(&self, version: Version, event: ChangeKind) -> bool {
        match event {
            ChangeKind::Create => true,
            ChangeKind::Destroy => false,
            ChangeKind::Update => self
                .snapshot_every
                .is_some_and(|every| version % every.get() == 0),
        }
    }
}

/// Whether and where the acting user is recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorPolicy {
    pub record: bool,
    pub field: String,
}

/// Validated tracking policy for all entity types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingRegistry {
    types: BTreeMap<EntityType, EntityPolicy>,
    author: AuthorPolicy,
    strict_gaps: bool,
}

impl TrackingRegistry {
    /// Policy for `entity_type`, or `NotTrackable`.
    pub fn policy(&self, entity_type: &EntityType) -> Result<&EntityPolicy, HistoryError> {
        self.types
            .get(entity_type)
            .ok_or_else(|| HistoryError::NotTrackable {
                entity_type: entity_type.clone(),
            })
    }

    pub fn is_tracked(&self, entity_type: &EntityType) -> bool {
        self.types.contains_key(entity_type)
    }

    pub fn entity_types(&self) -> impl Iterator<Item = &EntityType> {
        self.types.keys()
    }

    pub fn author(&self) -> &AuthorPolicy {
        &self.author
    }

    pub fn strict_gaps(&self) -> bool {
        self.strict_gaps
    }
}

/// SQL-safe identifier: ASCII letters, digits and underscores, not starting
/// with a digit.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
