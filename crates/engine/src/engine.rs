use std::sync::{Arc, Mutex};

use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracksync_storage::{AuditRecord, EntityRef, Payload, SyncStorage};

use crate::cache::TtlCache;
use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::executor::Executor;
use crate::hub::{Event, EventKind, NotificationHub};
use crate::locks::KeyedLocks;
use crate::reference::ReferenceLookup;
use crate::registry::{OperationRegistry, RegistryParts, RollbackEligibility};
use crate::snapshot::SnapshotStore;
use crate::tracker::{check_path_segment, Tracker};
use crate::types::{
    schema, Operation, OperationId, OperationKind, OperationStatus, OwnerId, RollbackParameters,
    SyncParameters,
};
use crate::worker::{Completion, Job, WorkerPool};

/// Page size used when a list request does not give one.
pub const DEFAULT_LIST_LIMIT: i64 = 20;

/// Failure reason for operations the worker pool would not accept.
pub const QUEUE_UNAVAILABLE: &str = "worker queue unavailable";

/// What one maintenance pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub snapshots_purged: usize,
    pub cache_entries_expired: usize,
    pub connections_reaped: usize,
}

/// The orchestrator: accepts work, runs it on the worker pool, finalizes
/// outcomes, and serves reads scoped to the calling owner.
pub struct SyncEngine {
    registry: Arc<OperationRegistry>,
    snapshots: Arc<SnapshotStore>,
    hub: Arc<NotificationHub>,
    cache: Arc<TtlCache<Value>>,
    references: ReferenceLookup,
    workers: WorkerPool,
    config: EngineConfig,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Wire the components together and spawn the background tasks.
    /// Must be called inside a tokio runtime.
    pub fn start(
        storage: Arc<dyn SyncStorage>,
        tracker: Arc<dyn Tracker>,
        config: EngineConfig,
    ) -> Result<Arc<Self>, EngineError> {
        config.validate().map_err(EngineError::Validation)?;

        let locks = Arc::new(KeyedLocks::new());
        let hub = Arc::new(NotificationHub::new(config.heartbeat_timeout()));
        let snapshots = Arc::new(SnapshotStore::new(
            Arc::clone(&storage),
            Arc::clone(&locks),
            config.storage_retries,
        ));
        let registry = Arc::new(OperationRegistry::new(
            RegistryParts {
                storage,
                snapshots: Arc::clone(&snapshots),
                tracker: Arc::clone(&tracker),
                hub: Arc::clone(&hub),
                locks,
            },
            config.storage_retries,
            config.list_limit_max,
            config.call_timeout(),
        ));
        let executor = Arc::new(Executor::new(
            Arc::clone(&registry),
            Arc::clone(&snapshots),
            Arc::clone(&tracker),
            Arc::clone(&hub),
            config.call_timeout(),
        ));
        let (workers, completions, dispatcher) =
            WorkerPool::start(executor, config.workers, config.queue_depth);

        let cache = Arc::new(TtlCache::new());
        let references = ReferenceLookup::new(
            tracker,
            Arc::clone(&cache),
            config.reference_ttl(),
            config.call_timeout(),
        );

        let finisher = tokio::spawn(finish_operations(
            Arc::clone(&registry),
            Arc::clone(&hub),
            completions,
        ));
        let maintenance = tokio::spawn(maintenance_loop(
            Arc::clone(&snapshots),
            Arc::clone(&cache),
            Arc::clone(&hub),
            config.clone(),
        ));

        tracing::info!(
            workers = config.workers,
            queue_depth = config.queue_depth,
            "sync engine started"
        );
        Ok(Arc::new(SyncEngine {
            registry,
            snapshots,
            hub,
            cache,
            references,
            workers,
            config,
            tasks: Mutex::new(vec![dispatcher, finisher, maintenance]),
        }))
    }

    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ──────────────────────────────────────────
    // Operations
    // ──────────────────────────────────────────

    /// Validate and persist a new operation, then queue it.
    ///
    /// If the queue refuses the job the operation is returned already
    /// `failed` rather than left pending.
    pub async fn create_operation(
        &self,
        owner_id: &OwnerId,
        kind: OperationKind,
        parameters: Value,
    ) -> Result<Operation, EngineError> {
        if kind == OperationKind::Rollback {
            return Err(EngineError::Validation(
                "rollback operations are requested through the rollback endpoint".to_string(),
            ));
        }
        let params = parse_sync_parameters(parameters)?;
        let payload = Payload::encode(schema::SYNC_PARAMETERS, &params)?;
        let operation = self.registry.create(owner_id, kind, payload).await?;
        self.enqueue(Job::new(operation)).await
    }

    async fn enqueue(&self, job: Job) -> Result<Operation, EngineError> {
        let operation = job.operation.clone();
        match self.workers.submit(job) {
            Ok(()) => Ok(operation),
            Err(e) => {
                tracing::error!(operation_id = %operation.id, error = %e, "job not accepted");
                let failed = self.registry.fail(&operation.id, QUEUE_UNAVAILABLE).await?;
                self.hub.publish(
                    &operation.owner_id,
                    Event::new(
                        operation.id,
                        EventKind::OperationFailed {
                            reason: QUEUE_UNAVAILABLE.to_string(),
                        },
                    ),
                );
                Ok(failed)
            }
        }
    }

    /// One of the caller's operations.
    pub async fn get_operation(
        &self,
        owner_id: &OwnerId,
        id: &OperationId,
    ) -> Result<Operation, EngineError> {
        let operation = self.registry.get(id).await?;
        if &operation.owner_id != owner_id {
            return Err(EngineError::Forbidden(format!(
                "operation {id} belongs to another owner"
            )));
        }
        Ok(operation)
    }

    pub async fn list_operations(
        &self,
        owner_id: &OwnerId,
        limit: Option<i64>,
    ) -> Result<Vec<Operation>, EngineError> {
        self.registry
            .list_by_owner(owner_id, limit.unwrap_or(DEFAULT_LIST_LIMIT))
            .await
    }

    pub async fn audit_trail(
        &self,
        owner_id: &OwnerId,
        id: &OperationId,
    ) -> Result<Vec<AuditRecord>, EngineError> {
        self.get_operation(owner_id, id).await?;
        self.registry.audit_trail(id).await
    }

    // ──────────────────────────────────────────
    // Rollback
    // ──────────────────────────────────────────

    pub async fn rollback_status(
        &self,
        owner_id: &OwnerId,
        id: &OperationId,
    ) -> Result<RollbackEligibility, EngineError> {
        self.get_operation(owner_id, id).await?;
        self.registry.can_rollback(id).await
    }

    /// Claim `target` for rollback and queue a `rollback` operation that
    /// performs it. Rejections surface here, before anything is queued.
    pub async fn request_rollback(
        &self,
        owner_id: &OwnerId,
        target: &OperationId,
    ) -> Result<Operation, EngineError> {
        let claim = self.registry.claim_rollback(target, owner_id).await?;
        let payload = Payload::encode(
            schema::ROLLBACK_PARAMETERS,
            &RollbackParameters { target: *target },
        )?;
        let operation = self
            .registry
            .create(owner_id, OperationKind::Rollback, payload)
            .await?;
        tracing::info!(operation_id = %operation.id, target = %target, "rollback requested");
        self.enqueue(Job::rollback(operation, claim)).await
    }

    // ──────────────────────────────────────────
    // Reference data
    // ──────────────────────────────────────────

    pub async fn reference(
        &self,
        owner_id: &OwnerId,
        system: &str,
        kind: &str,
    ) -> Result<Value, EngineError> {
        self.references.get(owner_id, system, kind).await
    }

    pub fn invalidate_reference(&self, owner_id: &OwnerId, system: &str, kind: &str) -> bool {
        self.references.invalidate(owner_id, system, kind)
    }

    // ──────────────────────────────────────────
    // Maintenance
    // ──────────────────────────────────────────

    /// Run one maintenance pass now.
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport, EngineError> {
        maintain(&self.snapshots, &self.cache, &self.hub, &self.config).await
    }

    /// Stop the background tasks. Queued jobs are abandoned.
    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|p| p.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn parse_sync_parameters(parameters: Value) -> Result<SyncParameters, EngineError> {
    let params: SyncParameters = serde_json::from_value(parameters)
        .map_err(|e| EngineError::Validation(format!("invalid parameters: {e}")))?;
    if params.mutations.is_empty() {
        return Err(EngineError::Validation(
            "parameters must contain at least one mutation".to_string(),
        ));
    }
    for mutation in &params.mutations {
        validate_target(&mutation.target)?;
    }
    Ok(params)
}

fn validate_target(target: &EntityRef) -> Result<(), EngineError> {
    let fields = [
        ("system", &target.system),
        ("entity_type", &target.entity_type),
        ("entity_id", &target.entity_id),
    ];
    for (name, value) in fields {
        check_path_segment(&format!("target {name}"), value).map_err(EngineError::Validation)?;
    }
    Ok(())
}

/// Apply each completion's final transition and notify the owner.
async fn finish_operations(
    registry: Arc<OperationRegistry>,
    hub: Arc<NotificationHub>,
    mut completions: mpsc::UnboundedReceiver<Completion>,
) {
    while let Some(completion) = completions.recv().await {
        let id = completion.operation_id;
        let event = match completion.outcome {
            Ok(result) => {
                let result_json = result.to_json().unwrap_or(Value::Null);
                match registry
                    .transition(&id, OperationStatus::Completed, Some(result))
                    .await
                {
                    Ok(_) => EventKind::OperationCompleted {
                        result: result_json,
                    },
                    Err(e) => {
                        tracing::error!(operation_id = %id, error = %e, "could not mark operation completed");
                        let reason = format!("finalization failed: {e}");
                        if let Err(e) = registry.fail(&id, &reason).await {
                            tracing::error!(operation_id = %id, error = %e, "could not mark operation failed");
                        }
                        EventKind::OperationFailed { reason }
                    }
                }
            }
            Err(reason) => {
                if let Err(e) = registry.fail(&id, &reason).await {
                    tracing::error!(operation_id = %id, error = %e, "could not mark operation failed");
                }
                EventKind::OperationFailed { reason }
            }
        };
        tracing::debug!(operation_id = %id, kind = %completion.kind, event = event.type_name(), "operation finished");
        hub.publish(&completion.owner_id, Event::new(id, event));
    }
}

async fn maintenance_loop(
    snapshots: Arc<SnapshotStore>,
    cache: Arc<TtlCache<Value>>,
    hub: Arc<NotificationHub>,
    config: EngineConfig,
) {
    let mut interval = tokio::time::interval(config.sweep_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval.tick().await;
    loop {
        interval.tick().await;
        match maintain(&snapshots, &cache, &hub, &config).await {
            Ok(report) => tracing::debug!(?report, "maintenance pass finished"),
            Err(e) => tracing::error!(error = %e, "maintenance pass failed"),
        }
    }
}

async fn maintain(
    snapshots: &SnapshotStore,
    cache: &TtlCache<Value>,
    hub: &NotificationHub,
    config: &EngineConfig,
) -> Result<MaintenanceReport, EngineError> {
    let cache_entries_expired = cache.sweep();
    let connections_reaped = hub.reap_idle().len();
    let cutoff = OffsetDateTime::now_utc() - config.snapshot_retention();
    let snapshots_purged = snapshots.purge(cutoff).await?;
    Ok(MaintenanceReport {
        snapshots_purged,
        cache_entries_expired,
        connections_reaped,
    })
}
