use retrace_common::EntityKey;
use retrace_kernel::HistoryError;

/// Errors from the storage backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("SQLite error: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("CBOR serialization error: {0}")]
    CborEncode(String),
    #[error("CBOR deserialization error: {0}")]
    CborDecode(String),
    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },
    #[error("schema version mismatch: file has v{file_version}, expected v{expected_version}")]
    SchemaMismatch {
        file_version: u32,
        expected_version: u32,
    },
    #[error("invalid column name `{0}`")]
    InvalidColumn(String),
    #[error("stored value out of range: {0}")]
    OutOfRange(String),
    #[error("no archived history for {0}")]
    NotArchived(EntityKey),
}

impl From<StoreError> for HistoryError {
    fn from(value: StoreError) -> Self {
        HistoryError::storage(value)
    }
}
