use std::fmt;
use std::time::Duration;

use tracksync_storage::{EntityRef, StorageError};

use crate::tracker::TrackerError;
use crate::types::{OperationId, OperationStatus};

/// Why a rollback request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackRejection {
    AlreadyRolledBack,
    NotCompleted,
    NoSnapshots,
    InProgress,
}

impl RollbackRejection {
    pub fn reason(self) -> &'static str {
        match self {
            RollbackRejection::AlreadyRolledBack => "already rolled back",
            RollbackRejection::NotCompleted => "not completed",
            RollbackRejection::NoSnapshots => "no snapshots recorded",
            RollbackRejection::InProgress => "rollback already in progress",
        }
    }
}

impl fmt::Display for RollbackRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

/// Errors surfaced by the engine to its callers.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid transition for operation {operation_id}: {from} -> {to}")]
    InvalidTransition {
        operation_id: OperationId,
        from: OperationStatus,
        to: OperationStatus,
    },

    #[error("rollback rejected: {0}")]
    Rejected(RollbackRejection),

    /// Some snapshots could not be re-applied. The operation keeps its
    /// `completed` status.
    #[error("rollback partially failed, not reverted: {}", join_refs(.unreverted))]
    PartialFailure {
        reverted: Vec<EntityRef>,
        unreverted: Vec<EntityRef>,
    },

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("collaborator error: {0}")]
    Collaborator(#[from] TrackerError),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl EngineError {
    /// Short failure reason recorded on an operation that ends in `failed`.
    pub fn failure_reason(&self) -> String {
        match self {
            EngineError::Timeout(_) => "timeout".to_string(),
            other => other.to_string(),
        }
    }
}

fn join_refs(refs: &[EntityRef]) -> String {
    refs.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}
