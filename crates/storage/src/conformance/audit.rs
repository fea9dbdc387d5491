use std::future::Future;

use super::{make_audit, TestResult};
use crate::SyncStorage;

pub(super) async fn run_audit_tests<S, F, Fut>(factory: &F) -> Vec<TestResult>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let mut results = Vec::new();

    results.push(TestResult::from_result(
        "audit",
        "audit_listed_oldest_first",
        audit_listed_oldest_first(factory).await,
    ));
    results.push(TestResult::from_result(
        "audit",
        "audit_ties_broken_by_id",
        audit_ties_broken_by_id(factory).await,
    ));
    results.push(TestResult::from_result(
        "audit",
        "audit_scoped_to_operation",
        audit_scoped_to_operation(factory).await,
    ));
    results.push(TestResult::from_result(
        "audit",
        "audit_does_not_require_operation_record",
        audit_does_not_require_operation_record(factory).await,
    ));

    results
}

async fn audit_listed_oldest_first<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    for (id, minute) in [("a-late", 9), ("a-early", 1), ("a-mid", 4)] {
        s.append_audit(&make_audit(id, "op-1", minute))
            .await
            .map_err(|e| format!("append {id}: {e}"))?;
    }

    let listed = s
        .list_audit("op-1")
        .await
        .map_err(|e| format!("list: {e}"))?;
    let ids: Vec<&str> = listed.iter().map(|r| r.id.as_str()).collect();
    if ids != ["a-early", "a-mid", "a-late"] {
        return Err(format!("expected [a-early, a-mid, a-late], got {ids:?}"));
    }
    if listed[0] != make_audit("a-early", "op-1", 1) {
        return Err(format!("entry altered: {:?}", listed[0]));
    }
    Ok(())
}

async fn audit_ties_broken_by_id<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    for id in ["a-2", "a-1", "a-3"] {
        s.append_audit(&make_audit(id, "op-1", 0))
            .await
            .map_err(|e| format!("append {id}: {e}"))?;
    }

    let listed = s
        .list_audit("op-1")
        .await
        .map_err(|e| format!("list: {e}"))?;
    let ids: Vec<&str> = listed.iter().map(|r| r.id.as_str()).collect();
    if ids != ["a-1", "a-2", "a-3"] {
        return Err(format!("expected [a-1, a-2, a-3], got {ids:?}"));
    }
    Ok(())
}

async fn audit_scoped_to_operation<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    s.append_audit(&make_audit("a-1", "op-1", 0))
        .await
        .map_err(|e| format!("append: {e}"))?;
    s.append_audit(&make_audit("a-2", "op-2", 0))
        .await
        .map_err(|e| format!("append: {e}"))?;

    let listed = s
        .list_audit("op-2")
        .await
        .map_err(|e| format!("list: {e}"))?;
    if listed.len() != 1 || listed[0].id != "a-2" {
        return Err(format!("expected only a-2, got {listed:?}"));
    }
    Ok(())
}

/// Rejected submissions are audited even though no operation was stored.
async fn audit_does_not_require_operation_record<S, F, Fut>(factory: &F) -> Result<(), String>
where
    S: SyncStorage,
    F: Fn() -> Fut,
    Fut: Future<Output = S>,
{
    let s = factory().await;
    s.append_audit(&make_audit("a-1", "op-never-stored", 0))
        .await
        .map_err(|e| format!("append: {e}"))?;
    Ok(())
}
