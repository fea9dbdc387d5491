mod common;

use std::sync::Arc;

use common::*;
use serde_json::json;
use tracksync_engine::{
    schema, EngineConfig, EngineError, OperationKind, OperationStatus, RollbackEligibility,
    RollbackRejection,
};
use tracksync_storage::Payload;

fn params() -> Payload {
    Payload::encode(schema::SYNC_PARAMETERS, &sync_params(1)).unwrap()
}

#[tokio::test]
async fn status_never_moves_backwards() {
    let engine = start_engine(FakeTracker::new(), test_config());
    let registry = engine.registry();
    let op = registry
        .create(&owner("a"), OperationKind::Sync, params())
        .await
        .unwrap();

    registry
        .transition(&op.id, OperationStatus::InProgress, None)
        .await
        .unwrap();
    let err = registry
        .transition(&op.id, OperationStatus::Pending, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition {
            from: OperationStatus::InProgress,
            to: OperationStatus::Pending,
            ..
        }
    ));
    assert_eq!(
        registry.get(&op.id).await.unwrap().status,
        OperationStatus::InProgress
    );

    let audit = registry.audit_trail(&op.id).await.unwrap();
    assert!(audit
        .iter()
        .any(|a| a.action == "transition" && a.outcome == "rejected"));
}

#[tokio::test]
async fn versions_advance_with_each_transition() {
    let engine = start_engine(FakeTracker::new(), test_config());
    let registry = engine.registry();
    let op = registry
        .create(&owner("a"), OperationKind::Sync, params())
        .await
        .unwrap();
    let running = registry
        .transition(&op.id, OperationStatus::InProgress, None)
        .await
        .unwrap();
    let result = Payload::encode(schema::SYNC_RESULT, &json!({ "applied": [] })).unwrap();
    let done = registry
        .transition(&op.id, OperationStatus::Completed, Some(result.clone()))
        .await
        .unwrap();
    assert_eq!(running.version, op.version + 1);
    assert_eq!(done.version, op.version + 2);
    assert_eq!(registry.get(&op.id).await.unwrap().result, Some(result));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_transitions_have_one_winner() {
    let engine = start_engine(FakeTracker::new(), test_config());
    let op = engine
        .registry()
        .create(&owner("a"), OperationKind::Sync, params())
        .await
        .unwrap();
    let id = op.id;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            engine
                .registry()
                .transition(&id, OperationStatus::InProgress, None)
                .await
                .is_ok()
        }));
    }
    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
async fn failing_a_pending_operation_passes_through_in_progress() {
    let engine = start_engine(FakeTracker::new(), test_config());
    let registry = engine.registry();
    let op = registry
        .create(&owner("a"), OperationKind::Sync, params())
        .await
        .unwrap();
    let failed = registry.fail(&op.id, "boom").await.unwrap();
    assert_eq!(failed.status, OperationStatus::Failed);
    assert_eq!(failed.failure_reason.as_deref(), Some("boom"));

    let transitions: Vec<_> = registry
        .audit_trail(&op.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|a| a.action == "transition")
        .filter_map(|a| a.detail)
        .collect();
    assert_eq!(
        transitions,
        ["pending -> in_progress", "in_progress -> failed: boom"]
    );
}

#[tokio::test]
async fn list_limit_is_clamped_and_newest_first() {
    let config = EngineConfig {
        list_limit_max: 2,
        ..test_config()
    };
    let engine = start_engine(FakeTracker::new(), config);
    let registry = engine.registry();
    let alice = owner("alice");
    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(
            registry
                .create(&alice, OperationKind::Sync, params())
                .await
                .unwrap()
                .id,
        );
    }
    registry
        .create(&owner("bob"), OperationKind::Sync, params())
        .await
        .unwrap();

    let one = registry.list_by_owner(&alice, 0).await.unwrap();
    assert_eq!(one.len(), 1);
    let capped = registry.list_by_owner(&alice, 1_000).await.unwrap();
    let listed: Vec<_> = capped.iter().map(|o| o.id).collect();
    assert_eq!(listed, [ids[2], ids[1]]);
}

#[tokio::test]
async fn can_rollback_is_side_effect_free() {
    let engine = start_engine(FakeTracker::new(), test_config());
    let registry = engine.registry();
    let op = registry
        .create(&owner("a"), OperationKind::Sync, params())
        .await
        .unwrap();

    let first = registry.can_rollback(&op.id).await.unwrap();
    let second = registry.can_rollback(&op.id).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(
        first,
        RollbackEligibility::Ineligible(RollbackRejection::NotCompleted)
    );
    assert_eq!(first.reason(), "not completed");
}

#[tokio::test]
async fn completed_without_snapshots_cannot_roll_back() {
    let engine = start_engine(FakeTracker::new(), test_config());
    let registry = engine.registry();
    let op = registry
        .create(&owner("a"), OperationKind::Sync, params())
        .await
        .unwrap();
    registry
        .transition(&op.id, OperationStatus::InProgress, None)
        .await
        .unwrap();
    registry
        .transition(&op.id, OperationStatus::Completed, None)
        .await
        .unwrap();
    assert_eq!(
        registry.can_rollback(&op.id).await.unwrap(),
        RollbackEligibility::Ineligible(RollbackRejection::NoSnapshots)
    );
}

#[tokio::test]
async fn one_rollback_claim_at_a_time() {
    let tracker = FakeTracker::new();
    let engine = start_engine(tracker, test_config());
    let alice = owner("alice");
    let mut sub = engine.hub().register(&alice);
    let op = engine
        .create_operation(&alice, OperationKind::Sync, sync_params(1))
        .await
        .unwrap();
    wait_for_finish(&mut sub, op.id).await;

    let registry = engine.registry();
    let claim = registry.claim_rollback(&op.id, &alice).await.unwrap();
    assert_eq!(
        registry.can_rollback(&op.id).await.unwrap(),
        RollbackEligibility::Ineligible(RollbackRejection::InProgress)
    );
    assert!(matches!(
        registry.claim_rollback(&op.id, &alice).await,
        Err(EngineError::Rejected(RollbackRejection::InProgress))
    ));

    drop(claim);
    assert!(registry.can_rollback(&op.id).await.unwrap().is_eligible());
}

#[tokio::test]
async fn unknown_operation_is_not_found() {
    let engine = start_engine(FakeTracker::new(), test_config());
    let missing = tracksync_engine::OperationId::new();
    assert!(matches!(
        engine.registry().get(&missing).await,
        Err(EngineError::NotFound(_))
    ));
    assert!(matches!(
        engine.registry().can_rollback(&missing).await,
        Err(EngineError::NotFound(_))
    ));
}
