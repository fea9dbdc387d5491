use std::future::Future;

use super::{make_operation, make_snapshot, seed_operation_with_status, ts, TestResult};
use crate::{StorageError, SyncStorage};

const TERMINAL_NOT_ROLLED_BACK: &[&str] = &["completed", "failed"];

pub(super) async fn run_snapshot_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "snapshot",
        "snapshots_listed_in_sequence_order",
        snapshots_listed_in_sequence_order(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "snapshot_round_trips_absent_before_state",
        snapshot_round_trips_absent_before_state(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "duplicate_sequence_rejected",
        duplicate_sequence_rejected(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "duplicate_does_not_replace_original",
        duplicate_does_not_replace_original(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "snapshots_isolated_per_operation",
        snapshots_isolated_per_operation(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "purge_removes_old_snapshots_of_terminal_operations",
        purge_removes_old_snapshots_of_terminal_operations(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "purge_never_touches_non_terminal_operations",
        purge_never_touches_non_terminal_operations(factory).await,
    ));
    results.push(TestResult::from_result(
        "snapshot",
        "purge_skips_rolled_back_operations",
        purge_skips_rolled_back_operations(factory).await,
    ));

    results
}

async fn snapshots_listed_in_sequence_order<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    s.insert_operation(&make_operation("op-1", "7", 0))
        .await
        .map_err(|e| format!("insert op: {e}"))?;
    for seq in [2, 10, 1, 3] {
        s.insert_snapshot(&make_snapshot("op-1", seq, 0))
            .await
            .map_err(|e| format!("insert snapshot {seq}: {e}"))?;
    }

    let listed = s
        .list_snapshots("op-1")
        .await
        .map_err(|e| format!("list: {e}"))?;
    let seqs: Vec<i64> = listed.iter().map(|r| r.sequence).collect();
    if seqs != [1, 2, 3, 10] {
        return Err(format!("expected [1, 2, 3, 10], got {seqs:?}"));
    }
    if listed[0] != make_snapshot("op-1", 1, 0) {
        return Err(format!("snapshot 1 altered: {:?}", listed[0]));
    }
    Ok(())
}

async fn snapshot_round_trips_absent_before_state<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    s.insert_operation(&make_operation("op-1", "7", 0))
        .await
        .map_err(|e| format!("insert op: {e}"))?;
    let mut snapshot = make_snapshot("op-1", 1, 0);
    snapshot.before_state = None;
    s.insert_snapshot(&snapshot)
        .await
        .map_err(|e| format!("insert snapshot: {e}"))?;

    let listed = s
        .list_snapshots("op-1")
        .await
        .map_err(|e| format!("list: {e}"))?;
    if listed != [snapshot] {
        return Err(format!("expected absent before_state, got {listed:?}"));
    }
    Ok(())
}

async fn duplicate_sequence_rejected<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    s.insert_operation(&make_operation("op-1", "7", 0))
        .await
        .map_err(|e| format!("insert op: {e}"))?;
    s.insert_snapshot(&make_snapshot("op-1", 1, 0))
        .await
        .map_err(|e| format!("insert snapshot: {e}"))?;

    match s.insert_snapshot(&make_snapshot("op-1", 1, 5)).await {
        Err(StorageError::DuplicateSnapshot {
            operation_id,
            sequence,
        }) if operation_id == "op-1" && sequence == 1 => Ok(()),
        other => Err(format!("expected DuplicateSnapshot, got {:?}", other)),
    }
}

async fn duplicate_does_not_replace_original<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    s.insert_operation(&make_operation("op-1", "7", 0))
        .await
        .map_err(|e| format!("insert op: {e}"))?;
    let original = make_snapshot("op-1", 1, 0);
    s.insert_snapshot(&original)
        .await
        .map_err(|e| format!("insert snapshot: {e}"))?;
    let _ = s.insert_snapshot(&make_snapshot("op-1", 1, 5)).await;

    let listed = s
        .list_snapshots("op-1")
        .await
        .map_err(|e| format!("list: {e}"))?;
    if listed != [original] {
        return Err(format!("original snapshot replaced: {listed:?}"));
    }
    Ok(())
}

async fn snapshots_isolated_per_operation<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    for id in ["op-1", "op-2"] {
        s.insert_operation(&make_operation(id, "7", 0))
            .await
            .map_err(|e| format!("insert {id}: {e}"))?;
    }
    s.insert_snapshot(&make_snapshot("op-1", 1, 0))
        .await
        .map_err(|e| format!("insert: {e}"))?;
    s.insert_snapshot(&make_snapshot("op-2", 1, 0))
        .await
        .map_err(|e| format!("same sequence on another operation: {e}"))?;

    let listed = s
        .list_snapshots("op-2")
        .await
        .map_err(|e| format!("list: {e}"))?;
    if listed.len() != 1 || listed[0].operation_id != "op-2" {
        return Err(format!("expected one op-2 snapshot, got {listed:?}"));
    }
    Ok(())
}

async fn purge_removes_old_snapshots_of_terminal_operations<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_operation_with_status(&s, "op-done", "completed").await?;
    seed_operation_with_status(&s, "op-failed", "failed").await?;
    s.insert_snapshot(&make_snapshot("op-done", 1, 1))
        .await
        .map_err(|e| format!("insert: {e}"))?;
    s.insert_snapshot(&make_snapshot("op-done", 2, 30))
        .await
        .map_err(|e| format!("insert: {e}"))?;
    s.insert_snapshot(&make_snapshot("op-failed", 1, 2))
        .await
        .map_err(|e| format!("insert: {e}"))?;

    let purged = s
        .purge_snapshots(&ts(10), TERMINAL_NOT_ROLLED_BACK)
        .await
        .map_err(|e| format!("purge: {e}"))?;
    if purged != 2 {
        return Err(format!("expected 2 purged, got {purged}"));
    }

    let remaining = s
        .list_snapshots("op-done")
        .await
        .map_err(|e| format!("list: {e}"))?;
    let seqs: Vec<i64> = remaining.iter().map(|r| r.sequence).collect();
    if seqs != [2] {
        return Err(format!("expected only the recent snapshot left, got {seqs:?}"));
    }
    Ok(())
}

async fn purge_never_touches_non_terminal_operations<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_operation_with_status(&s, "op-running", "in_progress").await?;
    s.insert_operation(&make_operation("op-pending", "7", 0))
        .await
        .map_err(|e| format!("insert: {e}"))?;
    s.insert_snapshot(&make_snapshot("op-running", 1, 0))
        .await
        .map_err(|e| format!("insert: {e}"))?;
    s.insert_snapshot(&make_snapshot("op-pending", 1, 0))
        .await
        .map_err(|e| format!("insert: {e}"))?;

    let purged = s
        .purge_snapshots(&ts(59), TERMINAL_NOT_ROLLED_BACK)
        .await
        .map_err(|e| format!("purge: {e}"))?;
    if purged != 0 {
        return Err(format!("purged {purged} snapshots of live operations"));
    }
    Ok(())
}

async fn purge_skips_rolled_back_operations<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    seed_operation_with_status(&s, "op-reverted", "rolled_back").await?;
    s.insert_snapshot(&make_snapshot("op-reverted", 1, 0))
        .await
        .map_err(|e| format!("insert: {e}"))?;

    let purged = s
        .purge_snapshots(&ts(59), TERMINAL_NOT_ROLLED_BACK)
        .await
        .map_err(|e| format!("purge: {e}"))?;
    let remaining = s
        .list_snapshots("op-reverted")
        .await
        .map_err(|e| format!("list: {e}"))?;
    if purged != 0 || remaining.len() != 1 {
        return Err(format!(
            "rolled-back snapshots purged: purged={purged}, remaining={}",
            remaining.len()
        ));
    }
    Ok(())
}
