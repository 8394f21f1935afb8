use retrace_common::{AttributeMap, EntityKey, Value, Version};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of committed mutation a version record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Create,
    Update,
    Destroy,
}

impl ChangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Destroy => "destroy",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeKind {
    type Err = UnknownChangeKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "destroy" => Ok(Self::Destroy),
            other => Err(UnknownChangeKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown change kind `{0}`")]
pub struct UnknownChangeKind(pub String);

/// Where an in-memory entity stands relative to its backing row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// Never written.
    New,
    /// Backed by a stored row; `original` mirrors it.
    Persisted,
    /// Its row was deleted.
    Destroyed,
}

/// A live record whose attribute changes are versioned.
///
/// Mutations go through explicit operations. `original` holds the values as
/// last written to storage, so the dirty set is always `attributes` vs
/// `original`. A null value and an absent attribute are the same thing:
/// assigning null removes the attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedEntity {
    key: EntityKey,
    attributes: AttributeMap,
    original: AttributeMap,
    current_version: Version,
    lifecycle: Lifecycle,
}

impl TrackedEntity {
    /// A new, unsaved entity with no attributes.
    pub fn new(key: EntityKey) -> Self {
        Self {
            key,
            attributes: AttributeMap::new(),
            original: AttributeMap::new(),
            current_version: 0,
            lifecycle: Lifecycle::New,
        }
    }

    /// A new, unsaved entity with initial attributes.
    pub fn with_attributes(key: EntityKey, attributes: AttributeMap) -> Self {
        let mut entity = Self::new(key);
        for (name, value) in attributes {
            entity.set(name, value);
        }
        entity
    }

    /// Rehydrate an entity from its stored row.
    pub fn persisted(key: EntityKey, attributes: AttributeMap, current_version: Version) -> Self {
        Self {
            key,
            original: attributes.clone(),
            attributes,
            current_version,
            lifecycle: Lifecycle::Persisted,
        }
    }

    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    /// Live attribute values.
    pub fn attributes(&self) -> &AttributeMap {
        &self.attributes
    }

    /// Attribute values as last persisted.
    pub fn original(&self) -> &AttributeMap {
        &self.original
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// Value of the current-version pointer field as last persisted.
    pub fn current_version(&self) -> Version {
        self.current_version
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn is_persisted(&self) -> bool {
        self.lifecycle == Lifecycle::Persisted
    }

    /// Assign an attribute. Assigning null removes it.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let value = value.into();
        let name = name.into();
        if value.is_null() {
            self.attributes.remove(&name);
        } else {
            self.attributes.insert(name, value);
        }
    }

    /// Remove an attribute, returning its previous value.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.attributes.remove(name)
    }

    /// Names of attributes whose live value differs from the persisted one.
    pub fn changed_attributes(&self) -> Vec<&str> {
        let mut changed: Vec<&str> = self
            .attributes
            .iter()
            .filter(|(name, value)| self.original.get(name.as_str()) != Some(*value))
            .map(|(name, _)| name.as_str())
            .collect();
        changed.extend(
            self.original
                .keys()
                .filter(|name| !self.attributes.contains_key(name.as_str()))
                .map(|name| name.as_str()),
        );
        changed.sort_unstable();
        changed
    }

    pub fn is_dirty(&self) -> bool {
        self.attributes != self.original
    }

    /// Record that the live attributes were written. `version` is the new
    /// pointer value when one was assigned.
    pub fn mark_persisted(&mut self, version: Option<Version>) {
        self.original = self.attributes.clone();
        if let Some(version) = version {
            self.current_version = version;
        }
        self.lifecycle = Lifecycle::Persisted;
    }

    /// Record that the backing row was deleted at `version`.
    pub fn mark_destroyed(&mut self, version: Option<Version>) {
        self.attributes.clear();
        self.original.clear();
        if let Some(version) = version {
            self.current_version = version;
        }
        self.lifecycle = Lifecycle::Destroyed;
    }

    /// Replace the entity state with a committed historical state.
    pub fn restore(&mut self, attributes: AttributeMap, version: Version) {
        self.original = attributes.clone();
        self.attributes = attributes;
        self.current_version = version;
        self.lifecycle = Lifecycle::Persisted;
    }
}
