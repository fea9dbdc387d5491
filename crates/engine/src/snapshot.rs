use std::sync::Arc;

use time::OffsetDateTime;
use tracksync_storage::{format_timestamp, now_timestamp, EntityRef, SnapshotRecord, SyncStorage};

use crate::error::EngineError;
use crate::locks::KeyedLocks;
use crate::retry::with_retries;
use crate::types::{EntityState, OperationId, OperationStatus, Snapshot};

/// Operation statuses whose snapshots may be purged. Completed-then-rolled-back
/// operations keep theirs as a record of what was reverted.
const PURGEABLE: [OperationStatus; 2] = [OperationStatus::Completed, OperationStatus::Failed];

/// Append-only store of pre-mutation entity states.
///
/// Sequence numbers are assigned here, under the operation's lock, so each
/// operation's snapshots are numbered 1, 2, 3, ... in capture order.
pub struct SnapshotStore {
    storage: Arc<dyn SyncStorage>,
    locks: Arc<KeyedLocks>,
    retries: u32,
}

impl SnapshotStore {
    pub fn new(storage: Arc<dyn SyncStorage>, locks: Arc<KeyedLocks>, retries: u32) -> Self {
        Self {
            storage,
            locks,
            retries,
        }
    }

    /// Durably record `before` for `entity`. Returns the assigned sequence.
    ///
    /// When this returns an error the caller must not mutate the entity.
    pub async fn record(
        &self,
        operation_id: &OperationId,
        entity: &EntityRef,
        before: &EntityState,
    ) -> Result<i64, EngineError> {
        let key = operation_id.to_string();
        let _guard = self.locks.acquire(&key).await;
        let existing = with_retries(self.retries, "list_snapshots", || {
            self.storage.list_snapshots(&key)
        })
        .await?;
        let sequence = existing.last().map_or(1, |s| s.sequence + 1);

        let record = SnapshotRecord {
            operation_id: key.clone(),
            sequence,
            entity: entity.clone(),
            before_state: before.as_payload().cloned(),
            captured_at: now_timestamp(),
        };
        with_retries(self.retries, "insert_snapshot", || {
            self.storage.insert_snapshot(&record)
        })
        .await?;

        tracing::debug!(operation_id = %operation_id, sequence, entity = %entity, "snapshot recorded");
        Ok(sequence)
    }

    /// All snapshots of an operation in capture order.
    pub async fn list_for(&self, operation_id: &OperationId) -> Result<Vec<Snapshot>, EngineError> {
        let key = operation_id.to_string();
        let records = with_retries(self.retries, "list_snapshots", || {
            self.storage.list_snapshots(&key)
        })
        .await?;
        records
            .into_iter()
            .map(|r| Snapshot::try_from(r).map_err(EngineError::from))
            .collect()
    }

    /// Delete snapshots captured before `older_than` whose operation is in
    /// a purgeable terminal status. Returns how many were removed.
    pub async fn purge(&self, older_than: OffsetDateTime) -> Result<usize, EngineError> {
        let cutoff = format_timestamp(older_than);
        let statuses = PURGEABLE.map(OperationStatus::as_str);
        let purged = with_retries(self.retries, "purge_snapshots", || {
            self.storage.purge_snapshots(&cutoff, &statuses)
        })
        .await?;
        if purged > 0 {
            tracing::info!(purged, cutoff = %cutoff, "purged expired snapshots");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{schema, OperationKind, OwnerId};
    use tracksync_storage::{OperationRecord, Payload, SqliteStorage};

    async fn setup(status: OperationStatus) -> (SnapshotStore, Arc<dyn SyncStorage>, OperationId) {
        let storage: Arc<dyn SyncStorage> = Arc::new(SqliteStorage::open_in_memory().unwrap());
        let id = OperationId::new();
        let now = now_timestamp();
        storage
            .insert_operation(&OperationRecord {
                id: id.to_string(),
                owner_id: OwnerId::new("7").unwrap().to_string(),
                kind: OperationKind::Sync.as_str().to_string(),
                status: status.as_str().to_string(),
                parameters: Payload::encode(schema::SYNC_PARAMETERS, &serde_json::json!({}))
                    .unwrap(),
                result: None,
                failure_reason: None,
                version: 0,
                created_at: now.clone(),
                updated_at: now,
            })
            .await
            .unwrap();
        let store = SnapshotStore::new(Arc::clone(&storage), Arc::new(KeyedLocks::new()), 3);
        (store, storage, id)
    }

    fn entity(n: u32) -> EntityRef {
        EntityRef {
            system: "jira".to_string(),
            entity_type: "issue".to_string(),
            entity_id: format!("X-{n}"),
        }
    }

    #[tokio::test]
    async fn sequences_follow_capture_order() {
        let (store, _, id) = setup(OperationStatus::InProgress).await;
        let state = EntityState::from_json(&serde_json::json!({"title": "a"})).unwrap();
        for n in 1..=3 {
            assert_eq!(store.record(&id, &entity(n), &state).await.unwrap(), i64::from(n));
        }
        let snapshots = store.list_for(&id).await.unwrap();
        let ids: Vec<_> = snapshots.iter().map(|s| s.entity.entity_id.as_str()).collect();
        assert_eq!(ids, ["X-1", "X-2", "X-3"]);
    }

    #[tokio::test]
    async fn absent_state_round_trips() {
        let (store, _, id) = setup(OperationStatus::InProgress).await;
        store.record(&id, &entity(1), &EntityState::Absent).await.unwrap();
        let snapshots = store.list_for(&id).await.unwrap();
        assert_eq!(snapshots[0].before_state, EntityState::Absent);
    }

    #[tokio::test]
    async fn recording_for_unknown_operation_fails() {
        let (store, _, _) = setup(OperationStatus::InProgress).await;
        let err = store
            .record(&OperationId::new(), &entity(1), &EntityState::Absent)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Storage(_)), "{err:?}");
    }

    #[tokio::test]
    async fn purge_spares_non_terminal_operations() {
        let (store, _, id) = setup(OperationStatus::InProgress).await;
        store.record(&id, &entity(1), &EntityState::Absent).await.unwrap();
        let future = OffsetDateTime::now_utc() + time::Duration::days(1);
        assert_eq!(store.purge(future).await.unwrap(), 0);
        assert_eq!(store.list_for(&id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn purge_removes_old_snapshots_of_completed_operations() {
        let (store, _, id) = setup(OperationStatus::Completed).await;
        store.record(&id, &entity(1), &EntityState::Absent).await.unwrap();
        let past = OffsetDateTime::now_utc() - time::Duration::days(1);
        assert_eq!(store.purge(past).await.unwrap(), 0);
        let future = OffsetDateTime::now_utc() + time::Duration::days(1);
        assert_eq!(store.purge(future).await.unwrap(), 1);
        assert!(store.list_for(&id).await.unwrap().is_empty());
    }
}
