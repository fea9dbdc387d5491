use std::future::Future;

use super::{make_operation, TestResult};
use crate::record::Payload;
use crate::{StorageError, SyncStorage};

pub(super) async fn run_operation_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "operation",
        "insert_then_get_returns_same_record",
        insert_then_get_returns_same_record(factory).await,
    ));
    results.push(TestResult::from_result(
        "operation",
        "insert_duplicate_returns_already_exists",
        insert_duplicate_returns_already_exists(factory).await,
    ));
    results.push(TestResult::from_result(
        "operation",
        "update_with_correct_version_succeeds",
        update_with_correct_version_succeeds(factory).await,
    ));
    results.push(TestResult::from_result(
        "operation",
        "version_increments_sequentially",
        version_increments_sequentially(factory).await,
    ));
    results.push(TestResult::from_result(
        "operation",
        "update_with_wrong_version_returns_conflict",
        update_with_wrong_version_returns_conflict(factory).await,
    ));
    results.push(TestResult::from_result(
        "operation",
        "conflict_does_not_change_record",
        conflict_does_not_change_record(factory).await,
    ));
    results.push(TestResult::from_result(
        "operation",
        "update_persists_result_and_failure_reason",
        update_persists_result_and_failure_reason(factory).await,
    ));
    results.push(TestResult::from_result(
        "operation",
        "list_returns_most_recent_first",
        list_returns_most_recent_first(factory).await,
    ));
    results.push(TestResult::from_result(
        "operation",
        "list_breaks_ties_by_id_descending",
        list_breaks_ties_by_id_descending(factory).await,
    ));
    results.push(TestResult::from_result(
        "operation",
        "list_respects_limit",
        list_respects_limit(factory).await,
    ));
    results.push(TestResult::from_result(
        "operation",
        "list_zero_limit_returns_all",
        list_zero_limit_returns_all(factory).await,
    ));
    results.push(TestResult::from_result(
        "operation",
        "list_is_scoped_to_owner",
        list_is_scoped_to_owner(factory).await,
    ));

    results
}

async fn insert_then_get_returns_same_record<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let record = make_operation("op-1", "7", 0);
    s.insert_operation(&record)
        .await
        .map_err(|e| format!("insert: {e}"))?;
    let loaded = s
        .get_operation("op-1")
        .await
        .map_err(|e| format!("get: {e}"))?;
    if loaded != record {
        return Err(format!("expected {record:?}, got {loaded:?}"));
    }
    Ok(())
}

async fn insert_duplicate_returns_already_exists<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let record = make_operation("op-1", "7", 0);
    s.insert_operation(&record)
        .await
        .map_err(|e| format!("insert: {e}"))?;
    match s.insert_operation(&record).await {
        Err(StorageError::AlreadyExists { operation_id }) if operation_id == "op-1" => Ok(()),
        other => Err(format!("expected AlreadyExists, got {:?}", other)),
    }
}

async fn update_with_correct_version_succeeds<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut record = make_operation("op-1", "7", 0);
    s.insert_operation(&record)
        .await
        .map_err(|e| format!("insert: {e}"))?;

    record.status = "in_progress".to_string();
    let version = s
        .update_operation(&record, 0)
        .await
        .map_err(|e| format!("update: {e}"))?;
    if version != 1 {
        return Err(format!("expected new version 1, got {version}"));
    }

    let loaded = s
        .get_operation("op-1")
        .await
        .map_err(|e| format!("get: {e}"))?;
    if loaded.status != "in_progress" || loaded.version != 1 {
        return Err(format!(
            "expected in_progress at version 1, got {} at version {}",
            loaded.status, loaded.version
        ));
    }
    Ok(())
}

async fn version_increments_sequentially<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let record = make_operation("op-1", "7", 0);
    s.insert_operation(&record)
        .await
        .map_err(|e| format!("insert: {e}"))?;

    for expected in 0..5 {
        let version = s
            .update_operation(&record, expected)
            .await
            .map_err(|e| format!("update at {expected}: {e}"))?;
        if version != expected + 1 {
            return Err(format!("expected {}, got {version}", expected + 1));
        }
    }
    Ok(())
}

async fn update_with_wrong_version_returns_conflict<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let record = make_operation("op-1", "7", 0);
    s.insert_operation(&record)
        .await
        .map_err(|e| format!("insert: {e}"))?;

    match s.update_operation(&record, 3).await {
        Err(StorageError::ConcurrentConflict {
            operation_id,
            expected_version,
        }) if operation_id == "op-1" && expected_version == 3 => Ok(()),
        other => Err(format!("expected ConcurrentConflict, got {:?}", other)),
    }
}

async fn conflict_does_not_change_record<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut record = make_operation("op-1", "7", 0);
    s.insert_operation(&record)
        .await
        .map_err(|e| format!("insert: {e}"))?;

    record.status = "failed".to_string();
    let _ = s.update_operation(&record, 7).await;

    let loaded = s
        .get_operation("op-1")
        .await
        .map_err(|e| format!("get: {e}"))?;
    if loaded.status != "pending" || loaded.version != 0 {
        return Err(format!(
            "conflicting update leaked: status {} version {}",
            loaded.status, loaded.version
        ));
    }
    Ok(())
}

async fn update_persists_result_and_failure_reason<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    let mut record = make_operation("op-1", "7", 0);
    s.insert_operation(&record)
        .await
        .map_err(|e| format!("insert: {e}"))?;

    record.status = "failed".to_string();
    record.result = Some(Payload {
        schema: "sync.result/1".to_string(),
        bytes: br#"{"applied":[]}"#.to_vec(),
    });
    record.failure_reason = Some("timeout".to_string());
    s.update_operation(&record, 0)
        .await
        .map_err(|e| format!("update: {e}"))?;

    let loaded = s
        .get_operation("op-1")
        .await
        .map_err(|e| format!("get: {e}"))?;
    if loaded.result != record.result {
        return Err(format!("result not persisted: {:?}", loaded.result));
    }
    if loaded.failure_reason.as_deref() != Some("timeout") {
        return Err(format!(
            "failure_reason not persisted: {:?}",
            loaded.failure_reason
        ));
    }
    Ok(())
}

async fn list_returns_most_recent_first<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    for (id, minute) in [("op-a", 5), ("op-b", 1), ("op-c", 9)] {
        s.insert_operation(&make_operation(id, "7", minute))
            .await
            .map_err(|e| format!("insert {id}: {e}"))?;
    }

    let listed = s
        .list_operations("7", 0)
        .await
        .map_err(|e| format!("list: {e}"))?;
    let ids: Vec<&str> = listed.iter().map(|r| r.id.as_str()).collect();
    if ids != ["op-c", "op-a", "op-b"] {
        return Err(format!("expected [op-c, op-a, op-b], got {ids:?}"));
    }
    Ok(())
}

async fn list_breaks_ties_by_id_descending<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    for id in ["op-1", "op-3", "op-2"] {
        s.insert_operation(&make_operation(id, "7", 0))
            .await
            .map_err(|e| format!("insert {id}: {e}"))?;
    }

    let listed = s
        .list_operations("7", 0)
        .await
        .map_err(|e| format!("list: {e}"))?;
    let ids: Vec<&str> = listed.iter().map(|r| r.id.as_str()).collect();
    if ids != ["op-3", "op-2", "op-1"] {
        return Err(format!("expected [op-3, op-2, op-1], got {ids:?}"));
    }
    Ok(())
}

async fn list_respects_limit<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    for minute in 0..5 {
        s.insert_operation(&make_operation(&format!("op-{minute}"), "7", minute))
            .await
            .map_err(|e| format!("insert: {e}"))?;
    }

    let listed = s
        .list_operations("7", 2)
        .await
        .map_err(|e| format!("list: {e}"))?;
    let ids: Vec<&str> = listed.iter().map(|r| r.id.as_str()).collect();
    if ids != ["op-4", "op-3"] {
        return Err(format!("expected [op-4, op-3], got {ids:?}"));
    }
    Ok(())
}

async fn list_zero_limit_returns_all<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    for minute in 0..4 {
        s.insert_operation(&make_operation(&format!("op-{minute}"), "7", minute))
            .await
            .map_err(|e| format!("insert: {e}"))?;
    }

    let listed = s
        .list_operations("7", 0)
        .await
        .map_err(|e| format!("list: {e}"))?;
    if listed.len() != 4 {
        return Err(format!("expected 4 operations, got {}", listed.len()));
    }
    Ok(())
}

async fn list_is_scoped_to_owner<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    s.insert_operation(&make_operation("op-mine", "7", 0))
        .await
        .map_err(|e| format!("insert: {e}"))?;
    s.insert_operation(&make_operation("op-theirs", "8", 1))
        .await
        .map_err(|e| format!("insert: {e}"))?;

    let listed = s
        .list_operations("7", 0)
        .await
        .map_err(|e| format!("list: {e}"))?;
    if listed.len() != 1 || listed[0].id != "op-mine" {
        return Err(format!("expected only op-mine, got {listed:?}"));
    }
    Ok(())
}
