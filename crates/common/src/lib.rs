//! Shared identifiers and attribute types used across the retrace crates.

pub mod types;

pub use types::{AttributeMap, AuthorId, EntityId, EntityKey, EntityType, Value, Version};
