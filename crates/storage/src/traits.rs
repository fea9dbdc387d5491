use async_trait::async_trait;

use crate::error::StorageError;
use crate::record::{AuditRecord, OperationRecord, SnapshotRecord};

/// The storage trait for tracksync backends.
///
/// A `SyncStorage` implementation durably stores operations, their
/// pre-mutation snapshots, and the audit trail. Which implementation is used
/// is decided once at process start; nothing above this trait can tell them
/// apart.
///
/// ## Atomicity
///
/// Every method is atomic on its own: after a crash, a record written by
/// `insert_operation`, `update_operation`, `insert_snapshot` or
/// `append_audit` is either fully visible or absent. A half-written record
/// must never be returned by a subsequent read.
///
/// ## OCC Conflict Detection
///
/// `update_operation` performs an optimistic concurrency check:
/// `UPDATE WHERE version = expected_version`. If no row matches, the method
/// returns `Err(StorageError::ConcurrentConflict { ... })` and leaves the
/// stored record untouched.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync + 'static` to be shared across the
/// request handlers and the worker tasks.
#[async_trait]
pub trait SyncStorage: Send + Sync + 'static {
    // ── Operations ───────────────────────────────────────────────────────────

    /// Persist a new operation record as given (its `version` is stored as-is).
    ///
    /// Returns `Err(StorageError::AlreadyExists)` if the id is taken.
    async fn insert_operation(&self, record: &OperationRecord) -> Result<(), StorageError>;

    /// Replace an operation record, conditional on the stored version being
    /// `expected_version`. The stored version becomes `expected_version + 1`
    /// regardless of `record.version`.
    ///
    /// Returns the new version on success.
    async fn update_operation(
        &self,
        record: &OperationRecord,
        expected_version: i64,
    ) -> Result<i64, StorageError>;

    /// Read an operation by id.
    ///
    /// Returns `Err(StorageError::OperationNotFound)` if it does not exist.
    async fn get_operation(&self, operation_id: &str) -> Result<OperationRecord, StorageError>;

    /// List an owner's operations, most recent first (`created_at` descending,
    /// ties broken by id descending).
    ///
    /// - `limit`: maximum number of results (0 = no limit)
    async fn list_operations(
        &self,
        owner_id: &str,
        limit: usize,
    ) -> Result<Vec<OperationRecord>, StorageError>;

    // ── Snapshots ────────────────────────────────────────────────────────────

    /// Append a snapshot. Durable once this returns `Ok`.
    ///
    /// Returns `Err(StorageError::OperationNotFound)` if the owning operation
    /// does not exist and `Err(StorageError::DuplicateSnapshot)` if the
    /// `(operation_id, sequence)` pair is already taken.
    async fn insert_snapshot(&self, record: &SnapshotRecord) -> Result<(), StorageError>;

    /// All snapshots of an operation in ascending `sequence` order.
    async fn list_snapshots(&self, operation_id: &str)
        -> Result<Vec<SnapshotRecord>, StorageError>;

    /// Delete snapshots captured strictly before `captured_before` whose owning
    /// operation's status is one of `eligible_statuses`. Returns the number
    /// of deleted snapshots.
    async fn purge_snapshots(
        &self,
        captured_before: &str,
        eligible_statuses: &[&str],
    ) -> Result<usize, StorageError>;

    // ── Audit trail (append-only) ────────────────────────────────────────────

    /// Append an audit entry. Entries are never updated or deleted.
    async fn append_audit(&self, record: &AuditRecord) -> Result<(), StorageError>;

    /// All audit entries of an operation, oldest first (`recorded_at`
    /// ascending, ties broken by id ascending).
    async fn list_audit(&self, operation_id: &str) -> Result<Vec<AuditRecord>, StorageError>;
}
