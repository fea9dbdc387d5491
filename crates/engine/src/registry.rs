use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracksync_storage::{now_timestamp, AuditRecord, EntityRef, Payload, StorageError, SyncStorage};
use uuid::Uuid;

use crate::error::{EngineError, RollbackRejection};
use crate::hub::{Event, EventKind, NotificationHub};
use crate::locks::KeyedLocks;
use crate::retry::with_retries;
use crate::snapshot::SnapshotStore;
use crate::tracker::Tracker;
use crate::types::{Operation, OperationId, OperationKind, OperationStatus, OwnerId};

/// Actor names recorded in the audit trail.
pub mod actor {
    pub const ENGINE: &str = "engine";
    pub const WORKER: &str = "worker";
}

/// Whether an operation may be rolled back right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackEligibility {
    Eligible { snapshots: usize },
    Ineligible(RollbackRejection),
}

impl RollbackEligibility {
    pub fn is_eligible(&self) -> bool {
        matches!(self, RollbackEligibility::Eligible { .. })
    }

    pub fn reason(&self) -> &'static str {
        match self {
            RollbackEligibility::Eligible { .. } => "eligible",
            RollbackEligibility::Ineligible(r) => r.reason(),
        }
    }
}

/// A claim on rolling back one operation. At most one exists per operation;
/// dropping it releases the claim.
pub struct RollbackClaim {
    target: OperationId,
    owner_id: OwnerId,
    in_flight: Arc<Mutex<HashSet<OperationId>>>,
}

impl RollbackClaim {
    pub fn target(&self) -> &OperationId {
        &self.target
    }
}

impl Drop for RollbackClaim {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        in_flight.remove(&self.target);
    }
}

/// What a successful rollback re-applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackReport {
    pub target: OperationId,
    pub reverted: Vec<EntityRef>,
}

/// The source of truth for operation lifecycle.
///
/// Every status change goes through [`OperationRegistry::transition`] (or the
/// rollback path), under a per-operation lock, with an optimistic version
/// check against storage and an audit entry.
pub struct OperationRegistry {
    storage: Arc<dyn SyncStorage>,
    snapshots: Arc<SnapshotStore>,
    tracker: Arc<dyn Tracker>,
    hub: Arc<NotificationHub>,
    locks: Arc<KeyedLocks>,
    in_flight: Arc<Mutex<HashSet<OperationId>>>,
    retries: u32,
    list_limit_max: i64,
    call_timeout: Duration,
}

pub struct RegistryParts {
    pub storage: Arc<dyn SyncStorage>,
    pub snapshots: Arc<SnapshotStore>,
    pub tracker: Arc<dyn Tracker>,
    pub hub: Arc<NotificationHub>,
    pub locks: Arc<KeyedLocks>,
}

impl OperationRegistry {
    pub fn new(
        parts: RegistryParts,
        retries: u32,
        list_limit_max: i64,
        call_timeout: Duration,
    ) -> Self {
        Self {
            storage: parts.storage,
            snapshots: parts.snapshots,
            tracker: parts.tracker,
            hub: parts.hub,
            locks: parts.locks,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            retries,
            list_limit_max: list_limit_max.max(1),
            call_timeout,
        }
    }

    // ──────────────────────────────────────────
    // Create / read
    // ──────────────────────────────────────────

    /// Persist a new `pending` operation.
    pub async fn create(
        &self,
        owner_id: &OwnerId,
        kind: OperationKind,
        parameters: Payload,
    ) -> Result<Operation, EngineError> {
        let now = now_timestamp();
        let operation = Operation {
            id: OperationId::new(),
            owner_id: owner_id.clone(),
            kind,
            status: OperationStatus::Pending,
            parameters,
            result: None,
            failure_reason: None,
            version: 0,
            created_at: now.clone(),
            updated_at: now,
        };
        let record = operation.to_record();
        with_retries(self.retries, "insert_operation", || {
            self.storage.insert_operation(&record)
        })
        .await?;

        tracing::info!(operation_id = %operation.id, owner_id = %owner_id, kind = %kind, "operation created");
        self.audit(&operation.id, actor::ENGINE, "created", "ok", Some(kind.as_str().to_string()))
            .await;
        Ok(operation)
    }

    pub async fn get(&self, id: &OperationId) -> Result<Operation, EngineError> {
        let key = id.to_string();
        let found = with_retries(self.retries, "get_operation", || {
            self.storage.get_operation(&key)
        })
        .await;
        match found {
            Ok(record) => Ok(Operation::try_from(record)?),
            Err(StorageError::OperationNotFound { .. }) => {
                Err(EngineError::NotFound(format!("operation {id}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The caller's operations, most recent first. `limit` is clamped into
    /// `1..=list_limit_max`.
    pub async fn list_by_owner(
        &self,
        owner_id: &OwnerId,
        limit: i64,
    ) -> Result<Vec<Operation>, EngineError> {
        let limit = limit.clamp(1, self.list_limit_max);
        let records = with_retries(self.retries, "list_operations", || {
            self.storage.list_operations(owner_id.as_str(), limit as usize)
        })
        .await?;
        records
            .into_iter()
            .map(|r| Operation::try_from(r).map_err(EngineError::from))
            .collect()
    }

    pub async fn audit_trail(&self, id: &OperationId) -> Result<Vec<AuditRecord>, EngineError> {
        let key = id.to_string();
        Ok(with_retries(self.retries, "list_audit", || self.storage.list_audit(&key)).await?)
    }

    // ──────────────────────────────────────────
    // Transitions
    // ──────────────────────────────────────────

    /// Move an operation to `to`, storing `result` when completing.
    pub async fn transition(
        &self,
        id: &OperationId,
        to: OperationStatus,
        result: Option<Payload>,
    ) -> Result<Operation, EngineError> {
        let _guard = self.locks.acquire(&id.to_string()).await;
        let current = self.get(id).await?;
        self.transition_locked(current, to, result, None, actor::WORKER)
            .await
    }

    /// Mark an operation failed. A `pending` operation first passes through
    /// `in_progress`, so failure never skips an edge.
    pub async fn fail(&self, id: &OperationId, reason: &str) -> Result<Operation, EngineError> {
        let _guard = self.locks.acquire(&id.to_string()).await;
        let mut current = self.get(id).await?;
        if current.status == OperationStatus::Pending {
            current = self
                .transition_locked(current, OperationStatus::InProgress, None, None, actor::ENGINE)
                .await?;
        }
        self.transition_locked(
            current,
            OperationStatus::Failed,
            None,
            Some(reason.to_string()),
            actor::WORKER,
        )
        .await
    }

    async fn transition_locked(
        &self,
        current: Operation,
        to: OperationStatus,
        result: Option<Payload>,
        failure_reason: Option<String>,
        actor: &str,
    ) -> Result<Operation, EngineError> {
        let from = current.status;
        if !from.can_transition_to(to) {
            tracing::warn!(operation_id = %current.id, %from, %to, "illegal transition rejected");
            self.audit(
                &current.id,
                actor,
                "transition",
                "rejected",
                Some(format!("{from} -> {to}")),
            )
            .await;
            return Err(EngineError::InvalidTransition {
                operation_id: current.id,
                from,
                to,
            });
        }

        let mut next = current.clone();
        next.status = to;
        next.updated_at = now_timestamp();
        if to == OperationStatus::Completed {
            next.result = result;
        }
        if to == OperationStatus::Failed {
            next.failure_reason = failure_reason.clone();
        }
        let record = next.to_record();
        let expected = current.version;

        let updated = with_retries(self.retries, "update_operation", || {
            self.storage.update_operation(&record, expected)
        })
        .await;
        match updated {
            Ok(version) => next.version = version,
            Err(StorageError::ConcurrentConflict { .. }) => {
                // A retried write may have landed before its error surfaced.
                let stored = self.get(&current.id).await?;
                if stored.status != to {
                    return Err(EngineError::InvalidTransition {
                        operation_id: current.id,
                        from: stored.status,
                        to,
                    });
                }
                next = stored;
            }
            Err(e) => return Err(e.into()),
        }

        tracing::info!(operation_id = %next.id, %from, %to, "operation transitioned");
        let detail = match &failure_reason {
            Some(reason) if to == OperationStatus::Failed => format!("{from} -> {to}: {reason}"),
            _ => format!("{from} -> {to}"),
        };
        self.audit(&next.id, actor, "transition", "ok", Some(detail))
            .await;
        Ok(next)
    }

    // ──────────────────────────────────────────
    // Rollback
    // ──────────────────────────────────────────

    /// Whether `id` can be rolled back now. Has no side effects.
    pub async fn can_rollback(&self, id: &OperationId) -> Result<RollbackEligibility, EngineError> {
        let operation = self.get(id).await?;
        if self.is_in_flight(id) {
            return Ok(RollbackEligibility::Ineligible(RollbackRejection::InProgress));
        }
        self.eligibility(&operation).await
    }

    async fn eligibility(&self, operation: &Operation) -> Result<RollbackEligibility, EngineError> {
        match operation.status {
            OperationStatus::RolledBack => {
                return Ok(RollbackEligibility::Ineligible(
                    RollbackRejection::AlreadyRolledBack,
                ))
            }
            OperationStatus::Completed => {}
            _ => {
                return Ok(RollbackEligibility::Ineligible(
                    RollbackRejection::NotCompleted,
                ))
            }
        }
        let snapshots = self.snapshots.list_for(&operation.id).await?.len();
        if snapshots == 0 {
            return Ok(RollbackEligibility::Ineligible(RollbackRejection::NoSnapshots));
        }
        Ok(RollbackEligibility::Eligible { snapshots })
    }

    fn is_in_flight(&self, id: &OperationId) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(id)
    }

    /// Validate ownership and eligibility, then claim the operation for
    /// rollback. A second claim fails until the first is dropped.
    pub async fn claim_rollback(
        &self,
        id: &OperationId,
        owner_id: &OwnerId,
    ) -> Result<RollbackClaim, EngineError> {
        let operation = self.get(id).await?;
        if &operation.owner_id != owner_id {
            return Err(EngineError::Forbidden(format!(
                "operation {id} belongs to another owner"
            )));
        }
        if let RollbackEligibility::Ineligible(rejection) = self.eligibility(&operation).await? {
            return Err(EngineError::Rejected(rejection));
        }
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|p| p.into_inner());
        if !in_flight.insert(*id) {
            return Err(EngineError::Rejected(RollbackRejection::InProgress));
        }
        Ok(RollbackClaim {
            target: *id,
            owner_id: owner_id.clone(),
            in_flight: Arc::clone(&self.in_flight),
        })
    }

    /// Claim and roll back in one call.
    pub async fn rollback(
        &self,
        id: &OperationId,
        owner_id: &OwnerId,
    ) -> Result<RollbackReport, EngineError> {
        let claim = self.claim_rollback(id, owner_id).await?;
        self.rollback_claimed(claim).await
    }

    /// Re-apply the target's snapshots newest-first.
    ///
    /// Every snapshot is attempted even after a failure. If all succeed the
    /// target becomes `rolled_back`; otherwise it stays `completed` and the
    /// error names the entities that were not reverted.
    pub async fn rollback_claimed(&self, claim: RollbackClaim) -> Result<RollbackReport, EngineError> {
        let id = claim.target;
        let _guard = self.locks.acquire(&id.to_string()).await;

        // Re-check under the lock: the status may have moved since the claim.
        let operation = self.get(&id).await?;
        if operation.owner_id != claim.owner_id {
            return Err(EngineError::Forbidden(format!(
                "operation {id} belongs to another owner"
            )));
        }
        let snapshots = match self.eligibility(&operation).await? {
            RollbackEligibility::Ineligible(rejection) => {
                return Err(EngineError::Rejected(rejection))
            }
            RollbackEligibility::Eligible { .. } => self.snapshots.list_for(&id).await?,
        };

        self.audit(
            &id,
            actor::ENGINE,
            "rollback_requested",
            "ok",
            Some(format!("{} snapshot(s)", snapshots.len())),
        )
        .await;
        self.hub
            .publish(&operation.owner_id, Event::new(id, EventKind::RollbackStarted));
        tracing::info!(operation_id = %id, snapshots = snapshots.len(), "rollback started");

        let mut reverted = Vec::new();
        let mut unreverted = Vec::new();
        for snapshot in snapshots.iter().rev() {
            let call = self
                .tracker
                .apply_mutation(&snapshot.entity, &snapshot.before_state);
            let outcome = match tokio::time::timeout(self.call_timeout, call).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err("timeout".to_string()),
            };
            match outcome {
                Ok(()) => reverted.push(snapshot.entity.clone()),
                Err(reason) => {
                    tracing::warn!(
                        operation_id = %id,
                        sequence = snapshot.sequence,
                        entity = %snapshot.entity,
                        reason = %reason,
                        "snapshot re-apply failed"
                    );
                    unreverted.push(snapshot.entity.clone());
                }
            }
        }

        if !unreverted.is_empty() {
            let err = EngineError::PartialFailure {
                reverted,
                unreverted,
            };
            self.audit(&id, actor::ENGINE, "rollback_partial_failure", "error", Some(err.to_string()))
                .await;
            self.hub.publish(
                &operation.owner_id,
                Event::new(
                    id,
                    EventKind::RollbackFailed {
                        reason: err.to_string(),
                    },
                ),
            );
            return Err(err);
        }

        self.transition_locked(operation.clone(), OperationStatus::RolledBack, None, None, actor::ENGINE)
            .await?;
        self.audit(
            &id,
            actor::ENGINE,
            "rollback_completed",
            "ok",
            Some(format!("{} entity(ies) reverted", reverted.len())),
        )
        .await;
        self.hub.publish(
            &operation.owner_id,
            Event::new(
                id,
                EventKind::RollbackCompleted {
                    reverted: reverted.len(),
                },
            ),
        );
        tracing::info!(operation_id = %id, reverted = reverted.len(), "rollback completed");
        Ok(RollbackReport {
            target: id,
            reverted,
        })
    }

    // ──────────────────────────────────────────
    // Audit
    // ──────────────────────────────────────────

    /// Append an audit entry. A failed append is logged, never fatal to the
    /// action it describes.
    pub(crate) async fn audit(
        &self,
        operation_id: &OperationId,
        actor: &str,
        action: &str,
        outcome: &str,
        detail: Option<String>,
    ) {
        let record = AuditRecord {
            id: Uuid::now_v7().to_string(),
            operation_id: operation_id.to_string(),
            actor: actor.to_string(),
            action: action.to_string(),
            outcome: outcome.to_string(),
            detail,
            recorded_at: now_timestamp(),
        };
        if let Err(e) =
            with_retries(self.retries, "append_audit", || self.storage.append_audit(&record)).await
        {
            tracing::error!(operation_id = %operation_id, action, error = %e, "audit append failed");
        }
    }
}
