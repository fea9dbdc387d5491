/// All errors that can be returned by a SyncStorage implementation.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Optimistic concurrency control conflict -- another writer updated the
    /// operation first. The expected version was not found.
    #[error("concurrent conflict on operation {operation_id}: expected version {expected_version}")]
    ConcurrentConflict {
        operation_id: String,
        expected_version: i64,
    },

    /// No operation record with the given id.
    #[error("operation not found: {operation_id}")]
    OperationNotFound { operation_id: String },

    /// An operation record with this id already exists.
    #[error("operation already exists: {operation_id}")]
    AlreadyExists { operation_id: String },

    /// A snapshot with this (operation_id, sequence) already exists.
    #[error("snapshot {sequence} already recorded for operation {operation_id}")]
    DuplicateSnapshot { operation_id: String, sequence: i64 },

    /// A record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A backend-specific storage error (I/O, DB connection, lock, etc.).
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    /// Whether the failure is transient and the call may be retried as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Backend(_))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}
