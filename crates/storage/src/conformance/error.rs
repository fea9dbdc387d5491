use std::future::Future;

use super::{make_operation, make_snapshot, TestResult};
use crate::{StorageError, SyncStorage};

pub(super) async fn run_error_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "error",
        "get_operation_nonexistent",
        get_operation_nonexistent(factory).await,
    ));
    results.push(TestResult::from_result(
        "error",
        "update_operation_nonexistent",
        update_operation_nonexistent(factory).await,
    ));
    results.push(TestResult::from_result(
        "error",
        "insert_snapshot_for_unknown_operation",
        insert_snapshot_for_unknown_operation(factory).await,
    ));
    results.push(TestResult::from_result(
        "error",
        "list_operations_empty_for_unknown_owner",
        list_operations_empty_for_unknown_owner(factory).await,
    ));
    results.push(TestResult::from_result(
        "error",
        "list_snapshots_empty_for_unknown_operation",
        list_snapshots_empty_for_unknown_operation(factory).await,
    ));
    results.push(TestResult::from_result(
        "error",
        "list_audit_empty_for_unknown_operation",
        list_audit_empty_for_unknown_operation(factory).await,
    ));

    results
}

// ── 1. get_operation on empty store returns OperationNotFound ─────────────────

async fn get_operation_nonexistent<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    match s.get_operation("op-999").await {
        Err(StorageError::OperationNotFound { operation_id }) if operation_id == "op-999" => Ok(()),
        other => Err(format!("expected OperationNotFound, got {:?}", other)),
    }
}

// ── 2. update_operation on empty store returns OperationNotFound ──────────────

async fn update_operation_nonexistent<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    match s.update_operation(&make_operation("op-999", "7", 0), 0).await {
        Err(StorageError::OperationNotFound { .. }) => Ok(()),
        other => Err(format!("expected OperationNotFound, got {:?}", other)),
    }
}

// ── 3. a snapshot needs its owning operation ──────────────────────────────────

async fn insert_snapshot_for_unknown_operation<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    match s.insert_snapshot(&make_snapshot("op-999", 1, 0)).await {
        Err(StorageError::OperationNotFound { .. }) => Ok(()),
        other => Err(format!("expected OperationNotFound, got {:?}", other)),
    }
}

// ── 4-6. listings of unknown keys are empty, not errors ───────────────────────

async fn list_operations_empty_for_unknown_owner<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let listed = s
        .list_operations("nobody", 10)
        .await
        .map_err(|e| format!("list: {e}"))?;
    if !listed.is_empty() {
        return Err(format!("expected empty list, got {listed:?}"));
    }
    Ok(())
}

async fn list_snapshots_empty_for_unknown_operation<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let listed = s
        .list_snapshots("op-999")
        .await
        .map_err(|e| format!("list: {e}"))?;
    if !listed.is_empty() {
        return Err(format!("expected empty list, got {listed:?}"));
    }
    Ok(())
}

async fn list_audit_empty_for_unknown_operation<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let listed = s
        .list_audit("op-999")
        .await
        .map_err(|e| format!("list: {e}"))?;
    if !listed.is_empty() {
        return Err(format!("expected empty list, got {listed:?}"));
    }
    Ok(())
}
