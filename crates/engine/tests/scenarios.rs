mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::*;
use serde_json::json;
use tracksync_engine::{
    EngineConfig, EngineError, OperationId, SyncEngine, EventKind, OperationKind, OperationStatus, RollbackEligibility,
    RollbackRejection, SyncResult, QUEUE_UNAVAILABLE,
};

#[tokio::test]
async fn sync_operation_completes_with_result() {
    let tracker = FakeTracker::new();
    let engine = start_engine(Arc::clone(&tracker), test_config());
    let alice = owner("alice");
    let mut sub = engine.hub().register(&alice);

    let created = engine
        .create_operation(&alice, OperationKind::Sync, sync_params(2))
        .await
        .unwrap();
    assert_eq!(created.status, OperationStatus::Pending);

    wait_for_finish(&mut sub, created.id).await;

    let done = engine.get_operation(&alice, &created.id).await.unwrap();
    assert_eq!(done.status, OperationStatus::Completed);
    let result: SyncResult = done
        .result
        .as_ref()
        .expect("completed operation has a result")
        .decode(tracksync_engine::schema::SYNC_RESULT)
        .unwrap();
    assert_eq!(result.applied, vec![issue(1), issue(2)]);
    assert_eq!(tracker.state(&issue(2)), Some(json!({ "title": "synced 2" })));
}

#[tokio::test]
async fn progress_events_arrive_in_order_before_completion() {
    let tracker = FakeTracker::new();
    let engine = start_engine(tracker, test_config());
    let alice = owner("alice");
    let mut sub = engine.hub().register(&alice);

    let op = engine
        .create_operation(&alice, OperationKind::Sync, sync_params(3))
        .await
        .unwrap();
    let events = wait_for_finish(&mut sub, op.id).await;

    let names: Vec<_> = events.iter().map(EventKind::type_name).collect();
    assert_eq!(
        names,
        [
            "operation_started",
            "operation_progress",
            "operation_progress",
            "operation_progress",
            "operation_completed"
        ]
    );
    let percents: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            EventKind::OperationProgress { percent, .. } => Some(*percent),
            _ => None,
        })
        .collect();
    assert_eq!(percents, [33, 66, 100]);
}

#[tokio::test]
async fn full_rollback_restores_entities_and_is_not_repeatable() {
    let tracker = FakeTracker::new();
    tracker.seed(&issue(1), json!({ "title": "original 1" }));
    tracker.seed(&issue(2), json!({ "title": "original 2" }));
    let engine = start_engine(Arc::clone(&tracker), test_config());
    let alice = owner("alice");
    let mut sub = engine.hub().register(&alice);

    let op = engine
        .create_operation(&alice, OperationKind::Sync, sync_params(3))
        .await
        .unwrap();
    wait_for_finish(&mut sub, op.id).await;
    assert_eq!(
        engine.rollback_status(&alice, &op.id).await.unwrap(),
        RollbackEligibility::Eligible { snapshots: 3 }
    );

    let rollback = engine.request_rollback(&alice, &op.id).await.unwrap();
    assert_eq!(rollback.kind, OperationKind::Rollback);
    wait_for_finish(&mut sub, rollback.id).await;

    let target = engine.get_operation(&alice, &op.id).await.unwrap();
    assert_eq!(target.status, OperationStatus::RolledBack);
    let rollback = engine.get_operation(&alice, &rollback.id).await.unwrap();
    assert_eq!(rollback.status, OperationStatus::Completed);

    assert_eq!(tracker.state(&issue(1)), Some(json!({ "title": "original 1" })));
    assert_eq!(tracker.state(&issue(2)), Some(json!({ "title": "original 2" })));
    assert_eq!(tracker.state(&issue(3)), None, "created entity is deleted again");

    let again = engine.request_rollback(&alice, &op.id).await.unwrap_err();
    assert!(
        matches!(again, EngineError::Rejected(RollbackRejection::AlreadyRolledBack)),
        "{again:?}"
    );
}

#[tokio::test]
async fn partial_rollback_keeps_completed_status_and_names_failures() {
    let tracker = FakeTracker::new();
    let engine = start_engine(Arc::clone(&tracker), test_config());
    let alice = owner("alice");
    let mut sub = engine.hub().register(&alice);

    let op = engine
        .create_operation(&alice, OperationKind::Sync, sync_params(3))
        .await
        .unwrap();
    wait_for_finish(&mut sub, op.id).await;

    tracker.fail_applies_to(&issue(2));
    let err = engine.registry().rollback(&op.id, &alice).await.unwrap_err();
    match err {
        EngineError::PartialFailure {
            reverted,
            unreverted,
        } => {
            assert_eq!(unreverted, vec![issue(2)]);
            assert_eq!(reverted, vec![issue(3), issue(1)]);
        }
        other => panic!("expected partial failure, got {other:?}"),
    }

    let target = engine.get_operation(&alice, &op.id).await.unwrap();
    assert_eq!(target.status, OperationStatus::Completed);

    let audit = engine.audit_trail(&alice, &op.id).await.unwrap();
    let partial = audit
        .iter()
        .find(|a| a.action == "rollback_partial_failure")
        .expect("partial failure is audited");
    assert!(partial.detail.as_deref().unwrap_or("").contains("jira:issue/X-2"));

    // The claim was released, so the rollback may be retried.
    assert!(engine
        .registry()
        .can_rollback(&op.id)
        .await
        .unwrap()
        .is_eligible());
}

#[tokio::test]
async fn partial_rollback_through_the_queue_fails_the_rollback_operation() {
    let tracker = FakeTracker::new();
    let engine = start_engine(Arc::clone(&tracker), test_config());
    let alice = owner("alice");
    let mut sub = engine.hub().register(&alice);

    let op = engine
        .create_operation(&alice, OperationKind::Sync, sync_params(3))
        .await
        .unwrap();
    wait_for_finish(&mut sub, op.id).await;

    tracker.fail_applies_to(&issue(2));
    let rollback = engine.request_rollback(&alice, &op.id).await.unwrap();
    let events = wait_for_finish(&mut sub, rollback.id).await;
    assert!(matches!(
        events.last(),
        Some(EventKind::OperationFailed { reason }) if reason.contains("jira:issue/X-2")
    ));
    let target = engine.get_operation(&alice, &op.id).await.unwrap();
    assert_eq!(target.status, OperationStatus::Completed);
}

#[tokio::test]
async fn hung_collaborator_fails_operation_with_timeout() {
    let tracker = FakeTracker::new();
    tracker.hang_fetches(true);
    let config = EngineConfig {
        call_timeout_ms: 100,
        ..EngineConfig::default()
    };
    let engine = start_engine(tracker, config);
    let alice = owner("alice");
    let mut sub = engine.hub().register(&alice);

    let op = engine
        .create_operation(&alice, OperationKind::Sync, sync_params(1))
        .await
        .unwrap();
    let events = wait_for_finish(&mut sub, op.id).await;
    assert_eq!(
        events.last(),
        Some(&EventKind::OperationFailed {
            reason: "timeout".to_string()
        })
    );

    let failed = engine.get_operation(&alice, &op.id).await.unwrap();
    assert_eq!(failed.status, OperationStatus::Failed);
    assert_eq!(failed.failure_reason.as_deref(), Some("timeout"));

    let err = engine.request_rollback(&alice, &op.id).await.unwrap_err();
    assert!(
        matches!(err, EngineError::Rejected(RollbackRejection::NotCompleted)),
        "{err:?}"
    );
}

#[tokio::test]
async fn other_owners_cannot_read_or_roll_back() {
    let tracker = FakeTracker::new();
    let engine = start_engine(tracker, test_config());
    let alice = owner("alice");
    let mallory = owner("mallory");
    let mut sub = engine.hub().register(&alice);

    let op = engine
        .create_operation(&alice, OperationKind::Sync, sync_params(1))
        .await
        .unwrap();
    wait_for_finish(&mut sub, op.id).await;

    assert!(matches!(
        engine.get_operation(&mallory, &op.id).await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(matches!(
        engine.request_rollback(&mallory, &op.id).await,
        Err(EngineError::Forbidden(_))
    ));
    assert!(engine.list_operations(&mallory, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn invalid_parameters_are_rejected_before_anything_is_stored() {
    let tracker = FakeTracker::new();
    let engine = start_engine(tracker, test_config());
    let alice = owner("alice");

    for params in [
        json!({ "mutations": [] }),
        json!({ "nope": true }),
        json!({ "mutations": [{ "target": { "system": "", "entity_type": "issue", "entity_id": "1" } }] }),
        json!({ "mutations": [{ "target": { "system": "jira", "entity_type": "issue", "entity_id": "X-1?x=1" } }] }),
        json!({ "mutations": [{ "target": { "system": "jira", "entity_type": "issue", "entity_id": "X 1" } }] }),
    ] {
        let err = engine
            .create_operation(&alice, OperationKind::Sync, params)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)), "{err:?}");
    }
    let err = engine
        .create_operation(&alice, OperationKind::Rollback, sync_params(1))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
    assert!(engine.list_operations(&alice, None).await.unwrap().is_empty());
}

#[tokio::test]
async fn saturated_queue_fails_new_operations() {
    let tracker = FakeTracker::new();
    tracker.hang_fetches(true);
    let config = EngineConfig {
        workers: 1,
        queue_depth: 1,
        call_timeout_ms: 60_000,
        ..EngineConfig::default()
    };
    let engine = start_engine(tracker, config);
    let alice = owner("alice");

    let mut refused = Vec::new();
    for _ in 0..5 {
        let op = engine
            .create_operation(&alice, OperationKind::Create, sync_params(1))
            .await
            .unwrap();
        if op.status == OperationStatus::Failed {
            refused.push(op);
        }
    }
    assert!(refused.len() >= 2, "at most three jobs fit: {}", refused.len());
    for op in refused {
        assert_eq!(op.failure_reason.as_deref(), Some(QUEUE_UNAVAILABLE));
    }
}

#[tokio::test]
async fn failed_snapshot_write_stops_the_mutation() {
    let tracker = FakeTracker::new();
    tracker.seed(&issue(1), json!({ "title": "orig" }));
    let config = EngineConfig {
        storage_retries: 1,
        ..test_config()
    };
    let engine = SyncEngine::start(SnapshotWritesFail::new(), Arc::<FakeTracker>::clone(&tracker), config).unwrap();
    let alice = owner("alice");
    let mut sub = engine.hub().register(&alice);

    let op = engine
        .create_operation(&alice, OperationKind::Sync, sync_params(1))
        .await
        .unwrap();
    let events = wait_for_finish(&mut sub, op.id).await;
    assert!(matches!(events.last(), Some(EventKind::OperationFailed { .. })));

    let failed = engine.get_operation(&alice, &op.id).await.unwrap();
    assert_eq!(failed.status, OperationStatus::Failed);
    assert_eq!(tracker.state(&issue(1)), Some(json!({ "title": "orig" })));

    let actions: Vec<String> = engine
        .audit_trail(&alice, &op.id)
        .await
        .unwrap()
        .into_iter()
        .map(|entry| entry.action)
        .collect();
    assert!(actions.iter().any(|a| a == "snapshot_failed"), "{actions:?}");
    assert!(!engine.rollback_status(&alice, &op.id).await.unwrap().is_eligible());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_operations_reach_every_connection_in_the_same_order() {
    let tracker = FakeTracker::new();
    let engine = start_engine(tracker, test_config());
    let alice = owner("alice");
    let mut first = engine.hub().register(&alice);
    let mut second = engine.hub().register(&alice);

    let a = engine
        .create_operation(&alice, OperationKind::Sync, sync_params(3))
        .await
        .unwrap();
    let b = engine
        .create_operation(&alice, OperationKind::Create, sync_params(2))
        .await
        .unwrap();

    let seen_first = collect_until_finished(&mut first, &[a.id, b.id]).await;
    let seen_second = collect_until_finished(&mut second, &[a.id, b.id]).await;
    assert_eq!(seen_first, seen_second);

    let mut per_operation: HashMap<OperationId, Vec<&str>> = HashMap::new();
    for (id, name) in &seen_first {
        per_operation.entry(*id).or_default().push(name.as_str());
    }
    for (id, steps) in [(a.id, 3), (b.id, 2)] {
        let names = &per_operation[&id];
        assert_eq!(names.len(), steps + 2, "{names:?}");
        assert_eq!(names[0], "operation_started");
        assert!(names[1..=steps].iter().all(|n| *n == "operation_progress"));
        assert_eq!(names[steps + 1], "operation_completed");
    }
}

/// Every (operation, event type) seen on `sub` until all `ids` finished.
async fn collect_until_finished(
    sub: &mut tracksync_engine::Subscription,
    ids: &[OperationId],
) -> Vec<(OperationId, String)> {
    let mut seen = Vec::new();
    let mut remaining = ids.len();
    while remaining > 0 {
        let event = tokio::time::timeout(std::time::Duration::from_secs(10), sub.events.recv())
            .await
            .expect("operations did not finish in time")
            .expect("event stream closed");
        if !ids.contains(&event.operation_id) {
            continue;
        }
        if matches!(
            event.kind,
            EventKind::OperationCompleted { .. } | EventKind::OperationFailed { .. }
        ) {
            remaining -= 1;
        }
        seen.push((event.operation_id, event.kind.type_name().to_string()));
    }
    seen
}
