//! Conformance test suite for `SyncStorage` implementations.
//!
//! This module provides a backend-agnostic test suite that any `SyncStorage`
//! implementation can run to verify correctness. The suite covers:
//!
//! - **Operations**: insert, read, owner-scoped listing order and limits
//! - **Version validation / OCC**: optimistic concurrency conflict detection
//! - **Snapshots**: append-only, per-operation sequence ordering, purge rules
//! - **Audit trail**: append-only, chronological listing
//! - **Concurrency**: racing writers against one record
//! - **Error handling**: correct error variants for invalid operations
//!
//! # Usage
//!
//! Backend crates call [`run_conformance_suite`] with a factory function that
//! creates a fresh, empty storage instance for each test:
//!
//! ```ignore
//! use tracksync_storage::conformance::run_conformance_suite;
//!
//! #[tokio::test]
//! async fn sqlite_conformance() {
//!     let report = run_conformance_suite(|| async {
//!         SqliteStorage::open_in_memory().unwrap()
//!     }).await;
//!     assert!(report.failed == 0, "{report}");
//! }
//! ```

mod audit;
mod concurrent;
mod error;
mod operation;
mod snapshot;

use std::fmt;
use std::future::Future;

use crate::record::{AuditRecord, EntityRef, OperationRecord, Payload, SnapshotRecord};
use crate::SyncStorage;

/// Result of a single conformance test.
#[derive(Debug, Clone)]
pub struct TestResult {
    /// Test category (e.g. "operation", "snapshot", "audit").
    pub category: String,
    /// Test name (e.g. "update_with_wrong_version_returns_conflict").
    pub name: String,
    /// Whether the test passed.
    pub passed: bool,
    /// Error message if the test failed.
    pub message: Option<String>,
}

impl TestResult {
    fn pass(category: &str, name: &str) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: true,
            message: None,
        }
    }

    fn fail(category: &str, name: &str, msg: String) -> Self {
        Self {
            category: category.to_string(),
            name: name.to_string(),
            passed: false,
            message: Some(msg),
        }
    }

    fn from_result(category: &str, name: &str, result: Result<(), String>) -> Self {
        match result {
            Ok(()) => Self::pass(category, name),
            Err(msg) => Self::fail(category, name, msg),
        }
    }
}

/// Aggregated report from a full conformance suite run.
#[derive(Debug, Clone)]
pub struct ConformanceReport {
    pub results: Vec<TestResult>,
    pub passed: usize,
    pub failed: usize,
    pub total: usize,
}

impl fmt::Display for ConformanceReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "Conformance: {}/{} passed ({} failed)",
            self.passed, self.total, self.failed
        )?;
        for r in &self.results {
            if !r.passed {
                writeln!(
                    f,
                    "  FAIL [{}/{}]: {}",
                    r.category,
                    r.name,
                    r.message.as_deref().unwrap_or("(no message)")
                )?;
            }
        }
        Ok(())
    }
}

/// Run the full conformance suite against a storage backend.
///
/// The `factory` function is called once per test to create a fresh, empty
/// storage instance, ensuring test isolation.
pub async fn run_conformance_suite<S, F, Fut>(factory: F) -> ConformanceReport
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.extend(operation::run_operation_tests(&factory).await);
    results.extend(error::run_error_tests(&factory).await);
    results.extend(snapshot::run_snapshot_tests(&factory).await);
    results.extend(audit::run_audit_tests(&factory).await);
    results.extend(concurrent::run_concurrent_tests(&factory).await);

    let passed = results.iter().filter(|r| r.passed).count();
    let total = results.len();

    ConformanceReport {
        results,
        passed,
        failed: total - passed,
        total,
    }
}

// ── Helpers: record constructors with sensible defaults ──────────────────────

fn ts(minute: u32) -> String {
    format!("2025-01-01T00:{minute:02}:00.000000Z")
}

fn make_operation(id: &str, owner_id: &str, created_minute: u32) -> OperationRecord {
    OperationRecord {
        id: id.to_string(),
        owner_id: owner_id.to_string(),
        kind: "sync".to_string(),
        status: "pending".to_string(),
        parameters: Payload {
            schema: "sync.parameters/1".to_string(),
            bytes: br#"{"mutations":[]}"#.to_vec(),
        },
        result: None,
        failure_reason: None,
        version: 0,
        created_at: ts(created_minute),
        updated_at: ts(created_minute),
    }
}

fn make_snapshot(operation_id: &str, sequence: i64, captured_minute: u32) -> SnapshotRecord {
    SnapshotRecord {
        operation_id: operation_id.to_string(),
        sequence,
        entity: EntityRef {
            system: "youtrack".to_string(),
            entity_type: "issue".to_string(),
            entity_id: format!("ISSUE-{sequence}"),
        },
        before_state: Some(Payload {
            schema: "entity.state/1".to_string(),
            bytes: format!(r#"{{"summary":"before {sequence}"}}"#).into_bytes(),
        }),
        captured_at: ts(captured_minute),
    }
}

fn make_audit(id: &str, operation_id: &str, recorded_minute: u32) -> AuditRecord {
    AuditRecord {
        id: id.to_string(),
        operation_id: operation_id.to_string(),
        actor: "7".to_string(),
        action: "transition".to_string(),
        outcome: "ok".to_string(),
        detail: Some("pending -> in_progress".to_string()),
        recorded_at: ts(recorded_minute),
    }
}

/// Insert an operation and move it to `status` with one OCC update.
async fn seed_operation_with_status<S: SyncStorage>(
    storage: &S,
    id: &str,
    status: &str,
) -> Result<(), String> {
    let mut record = make_operation(id, "7", 0);
    storage
        .insert_operation(&record)
        .await
        .map_err(|e| format!("insert {id}: {e}"))?;
    record.status = status.to_string();
    storage
        .update_operation(&record, 0)
        .await
        .map_err(|e| format!("update {id}: {e}"))?;
    Ok(())
}
