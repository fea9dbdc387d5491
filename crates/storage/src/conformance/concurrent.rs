use std::future::Future;
use std::sync::Arc;

use super::{make_audit, make_operation, make_snapshot, TestResult};
use crate::{StorageError, SyncStorage};

/// Number of concurrent tasks to spawn in each test.
const N: usize = 10;

pub(super) async fn run_concurrent_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_updates_exactly_one_wins",
        concurrent_updates_exactly_one_wins(factory).await,
    ));
    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_inserts_exactly_one_wins",
        concurrent_inserts_exactly_one_wins(factory).await,
    ));
    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_snapshot_same_sequence_exactly_one_wins",
        concurrent_snapshot_same_sequence_exactly_one_wins(factory).await,
    ));
    results.push(TestResult::from_result(
        "concurrent",
        "concurrent_audit_appends_all_kept",
        concurrent_audit_appends_all_kept(factory).await,
    ));

    results
}

// ── Concurrent update: exactly one wins ─────────────────────────────────────

/// N tasks each attempt to update the same operation from version 0.
/// Exactly one succeeds; the rest must get ConcurrentConflict.
async fn concurrent_updates_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    storage
        .insert_operation(&make_operation("op-1", "7", 0))
        .await
        .map_err(|e| format!("insert: {e}"))?;

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            let mut record = make_operation("op-1", "7", 0);
            record.failure_reason = Some(format!("writer-{i}"));
            match s.update_operation(&record, 0).await {
                Ok(_) => Ok(true),
                Err(StorageError::ConcurrentConflict { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        }));
    }

    let winners = count_winners(handles).await?;
    if winners != 1 {
        return Err(format!("expected exactly 1 winner, got {winners}"));
    }

    let stored = storage
        .get_operation("op-1")
        .await
        .map_err(|e| format!("get: {e}"))?;
    if stored.version != 1 {
        return Err(format!("expected version 1, got {}", stored.version));
    }
    Ok(())
}

// ── Concurrent insert: exactly one wins ─────────────────────────────────────

async fn concurrent_inserts_exactly_one_wins<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);

    let mut handles = Vec::new();
    for _ in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            match s.insert_operation(&make_operation("op-1", "7", 0)).await {
                Ok(()) => Ok(true),
                Err(StorageError::AlreadyExists { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        }));
    }

    let winners = count_winners(handles).await?;
    if winners != 1 {
        return Err(format!("expected exactly 1 winner, got {winners}"));
    }
    Ok(())
}

// ── Concurrent snapshot append at the same sequence ─────────────────────────

async fn concurrent_snapshot_same_sequence_exactly_one_wins<S, F, Fut>(
    factory: &F,
) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);
    storage
        .insert_operation(&make_operation("op-1", "7", 0))
        .await
        .map_err(|e| format!("insert: {e}"))?;

    let mut handles = Vec::new();
    for minute in 0..N as u32 {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            match s.insert_snapshot(&make_snapshot("op-1", 1, minute)).await {
                Ok(()) => Ok(true),
                Err(StorageError::DuplicateSnapshot { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        }));
    }

    let winners = count_winners(handles).await?;
    if winners != 1 {
        return Err(format!("expected exactly 1 winner, got {winners}"));
    }

    let listed = storage
        .list_snapshots("op-1")
        .await
        .map_err(|e| format!("list: {e}"))?;
    if listed.len() != 1 {
        return Err(format!("expected 1 snapshot, got {}", listed.len()));
    }
    Ok(())
}

// ── Concurrent audit appends are all retained ───────────────────────────────

async fn concurrent_audit_appends_all_kept<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let storage = Arc::new(factory().await);

    let mut handles = Vec::new();
    for i in 0..N {
        let s = storage.clone();
        handles.push(tokio::spawn(async move {
            s.append_audit(&make_audit(&format!("a-{i:02}"), "op-1", 0))
                .await
                .map(|()| true)
        }));
    }
    let appended = count_winners(handles).await?;
    if appended != N {
        return Err(format!("expected {N} appends, got {appended}"));
    }

    let listed = storage
        .list_audit("op-1")
        .await
        .map_err(|e| format!("list: {e}"))?;
    if listed.len() != N {
        return Err(format!("expected {N} entries, got {}", listed.len()));
    }
    Ok(())
}

async fn count_winners(
    handles: Vec<tokio::task::JoinHandle<Result<bool, StorageError>>>,
) -> Result<usize, String> {
    let mut winners = 0usize;
    for handle in handles {
        let won = handle
            .await
            .map_err(|e| format!("task panic: {e}"))?
            .map_err(|e| format!("storage error: {e}"))?;
        if won {
            winners += 1;
        }
    }
    Ok(winners)
}
