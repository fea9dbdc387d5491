#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracksync_engine::{
    schema, EngineConfig, EntityState, EventKind, OperationId, OwnerId, Subscription, SyncEngine,
    Tracker, TrackerError,
};
use tracksync_storage::{
    AuditRecord, EntityRef, OperationRecord, SnapshotRecord, SqliteStorage, StorageError,
    SyncStorage,
};

/// In-memory tracker with switches for slow, hanging, and failing calls.
#[derive(Default)]
pub struct FakeTracker {
    entities: Mutex<HashMap<EntityRef, Value>>,
    failing_applies: Mutex<HashSet<EntityRef>>,
    hang_fetches: AtomicBool,
    pub reference_calls: AtomicUsize,
    pub reference_delay: Mutex<Duration>,
}

impl FakeTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn seed(&self, entity: &EntityRef, value: Value) {
        self.entities.lock().unwrap().insert(entity.clone(), value);
    }

    pub fn state(&self, entity: &EntityRef) -> Option<Value> {
        self.entities.lock().unwrap().get(entity).cloned()
    }

    pub fn fail_applies_to(&self, entity: &EntityRef) {
        self.failing_applies.lock().unwrap().insert(entity.clone());
    }

    pub fn hang_fetches(&self, hang: bool) {
        self.hang_fetches.store(hang, Ordering::SeqCst);
    }
}

#[async_trait]
impl Tracker for FakeTracker {
    async fn fetch_entity(&self, entity: &EntityRef) -> Result<EntityState, TrackerError> {
        if self.hang_fetches.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        match self.state(entity) {
            Some(value) => Ok(EntityState::from_json(&value).unwrap()),
            None => Ok(EntityState::Absent),
        }
    }

    async fn apply_mutation(
        &self,
        entity: &EntityRef,
        state: &EntityState,
    ) -> Result<(), TrackerError> {
        if self.failing_applies.lock().unwrap().contains(entity) {
            return Err(TrackerError::Status {
                system: entity.system.clone(),
                status: 503,
            });
        }
        let mut entities = self.entities.lock().unwrap();
        match state {
            EntityState::Present(payload) => {
                let value: Value = payload.decode(schema::ENTITY_STATE).unwrap();
                entities.insert(entity.clone(), value);
            }
            EntityState::Absent => {
                entities.remove(entity);
            }
        }
        Ok(())
    }

    async fn fetch_reference(
        &self,
        system: &str,
        kind: &str,
        owner_id: &OwnerId,
    ) -> Result<Value, TrackerError> {
        self.reference_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.reference_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(json!({ "system": system, "kind": kind, "owner": owner_id.as_str() }))
    }
}

pub fn owner(id: &str) -> OwnerId {
    OwnerId::new(id).unwrap()
}

pub fn issue(n: u32) -> EntityRef {
    EntityRef {
        system: "jira".to_string(),
        entity_type: "issue".to_string(),
        entity_id: format!("X-{n}"),
    }
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        call_timeout_ms: 2_000,
        ..EngineConfig::default()
    }
}

pub fn start_engine(tracker: Arc<FakeTracker>, config: EngineConfig) -> Arc<SyncEngine> {
    let storage: Arc<dyn SyncStorage> = Arc::new(SqliteStorage::open_in_memory().unwrap());
    SyncEngine::start(storage, tracker, config).unwrap()
}

/// SQLite storage whose snapshot writes always fail with a backend error.
pub struct SnapshotWritesFail {
    inner: SqliteStorage,
}

impl SnapshotWritesFail {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: SqliteStorage::open_in_memory().unwrap(),
        })
    }
}

#[async_trait]
impl SyncStorage for SnapshotWritesFail {
    async fn insert_operation(&self, record: &OperationRecord) -> Result<(), StorageError> {
        self.inner.insert_operation(record).await
    }

    async fn update_operation(
        &self,
        record: &OperationRecord,
        expected_version: i64,
    ) -> Result<i64, StorageError> {
        self.inner.update_operation(record, expected_version).await
    }

    async fn get_operation(&self, operation_id: &str) -> Result<OperationRecord, StorageError> {
        self.inner.get_operation(operation_id).await
    }

    async fn list_operations(
        &self,
        owner_id: &str,
        limit: usize,
    ) -> Result<Vec<OperationRecord>, StorageError> {
        self.inner.list_operations(owner_id, limit).await
    }

    async fn insert_snapshot(&self, _record: &SnapshotRecord) -> Result<(), StorageError> {
        Err(StorageError::Backend("disk full".to_string()))
    }

    async fn list_snapshots(
        &self,
        operation_id: &str,
    ) -> Result<Vec<SnapshotRecord>, StorageError> {
        self.inner.list_snapshots(operation_id).await
    }

    async fn purge_snapshots(
        &self,
        captured_before: &str,
        eligible_statuses: &[&str],
    ) -> Result<usize, StorageError> {
        self.inner
            .purge_snapshots(captured_before, eligible_statuses)
            .await
    }

    async fn append_audit(&self, record: &AuditRecord) -> Result<(), StorageError> {
        self.inner.append_audit(record).await
    }

    async fn list_audit(&self, operation_id: &str) -> Result<Vec<AuditRecord>, StorageError> {
        self.inner.list_audit(operation_id).await
    }
}

/// Parameters setting issues `1..=n` to `{"title": "synced <n>"}`.
pub fn sync_params(n: u32) -> Value {
    let mutations: Vec<Value> = (1..=n)
        .map(|i| json!({ "target": issue(i), "state": { "title": format!("synced {i}") } }))
        .collect();
    json!({ "mutations": mutations })
}

/// Wait for the terminal event of `id`, returning every event seen for it.
pub async fn wait_for_finish(sub: &mut Subscription, id: OperationId) -> Vec<EventKind> {
    let mut seen = Vec::new();
    let deadline = Duration::from_secs(10);
    loop {
        let event = tokio::time::timeout(deadline, sub.events.recv())
            .await
            .expect("operation did not finish in time")
            .expect("event stream closed");
        if event.operation_id != id {
            continue;
        }
        let terminal = matches!(
            event.kind,
            EventKind::OperationCompleted { .. } | EventKind::OperationFailed { .. }
        );
        seen.push(event.kind);
        if terminal {
            return seen;
        }
    }
}
