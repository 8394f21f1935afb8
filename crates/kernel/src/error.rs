use retrace_common::{EntityKey, EntityType, Version};

/// Errors surfaced by capture, navigation and the storage seam.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("entity type `{entity_type}` is not tracked")]
    NotTrackable { entity_type: EntityType },
    #[error("version {version} of {entity} does not exist")]
    VersionNotFound { entity: EntityKey, version: Version },
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("version {version} of {entity} was written concurrently; retry the operation")]
    VersionConflict { entity: EntityKey, version: Version },
    #[error("history of {entity} is missing version {version}")]
    HistoryGap { entity: EntityKey, version: Version },
    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl HistoryError {
    /// Wrap a backend failure.
    pub fn storage(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Storage(Box::new(err))
    }

    /// Whether re-running the whole operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::VersionConflict { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_conflicts_are_retryable() {
        let conflict = HistoryError::VersionConflict {
            entity: EntityKey::new("article", "1"),
            version: 3,
        };
        assert!(conflict.is_retryable());

        let missing = HistoryError::VersionNotFound {
            entity: EntityKey::new("article", "1"),
            version: 9,
        };
        assert!(!missing.is_retryable());
        assert_eq!(missing.to_string(), "version 9 of article#1 does not exist");
    }

    #[test]
    fn storage_keeps_source() {
        let io = std::io::Error::other("disk gone");
        let err = HistoryError::storage(io);
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "disk gone");
    }
}
