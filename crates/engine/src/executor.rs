use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracksync_storage::Payload;

use crate::error::EngineError;
use crate::hub::{Event, EventKind, NotificationHub};
use crate::registry::{actor, OperationRegistry, RollbackClaim};
use crate::snapshot::SnapshotStore;
use crate::tracker::{Tracker, TrackerError};
use crate::types::{
    schema, EntityState, Operation, OperationKind, OperationStatus, RollbackParameters,
    RollbackResult, SyncParameters, SyncResult,
};
use crate::worker::Job;

/// Runs one job: moves the operation to `in_progress` and does its work.
///
/// The final transition is left to the completion handler, which receives
/// the returned outcome.
pub struct Executor {
    registry: Arc<OperationRegistry>,
    snapshots: Arc<SnapshotStore>,
    tracker: Arc<dyn Tracker>,
    hub: Arc<NotificationHub>,
    call_timeout: Duration,
}

impl Executor {
    pub fn new(
        registry: Arc<OperationRegistry>,
        snapshots: Arc<SnapshotStore>,
        tracker: Arc<dyn Tracker>,
        hub: Arc<NotificationHub>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            snapshots,
            tracker,
            hub,
            call_timeout,
        }
    }

    /// Execute `job`, returning the result payload or a failure reason.
    pub async fn run(&self, job: Job) -> Result<Payload, String> {
        let operation = job.operation;
        let id = operation.id;
        self.registry
            .transition(&id, OperationStatus::InProgress, None)
            .await
            .map_err(|e| e.failure_reason())?;
        self.hub
            .publish(&operation.owner_id, Event::new(id, EventKind::OperationStarted));

        let outcome = match operation.kind {
            OperationKind::Sync | OperationKind::Create => self.apply_mutations(&operation).await,
            OperationKind::Rollback => match job.claim {
                Some(claim) => self.roll_back(&operation, claim).await,
                None => Err(EngineError::Validation(
                    "rollback job carries no claim on its target".to_string(),
                )),
            },
        };
        outcome.map_err(|e| {
            tracing::warn!(operation_id = %id, error = %e, "operation failed");
            e.failure_reason()
        })
    }

    async fn apply_mutations(&self, operation: &Operation) -> Result<Payload, EngineError> {
        let params: SyncParameters = operation.parameters.decode(schema::SYNC_PARAMETERS)?;
        let total = params.mutations.len();
        let mut applied = Vec::with_capacity(total);

        for (index, mutation) in params.mutations.iter().enumerate() {
            let target = &mutation.target;
            let before = self.call(self.tracker.fetch_entity(target)).await?;

            // No snapshot, no mutation.
            if let Err(e) = self.snapshots.record(&operation.id, target, &before).await {
                self.registry
                    .audit(
                        &operation.id,
                        actor::WORKER,
                        "snapshot_failed",
                        "error",
                        Some(format!("{target}: {e}")),
                    )
                    .await;
                return Err(e);
            }

            let desired = match &mutation.state {
                Some(value) => EntityState::from_json(value)?,
                None => EntityState::Absent,
            };
            self.call(self.tracker.apply_mutation(target, &desired)).await?;
            applied.push(target.clone());

            let percent = ((index + 1) * 100 / total) as u8;
            self.hub.publish(
                &operation.owner_id,
                Event::new(
                    operation.id,
                    EventKind::OperationProgress {
                        percent,
                        message: format!("applied {target}"),
                    },
                ),
            );
        }

        Ok(Payload::encode(schema::SYNC_RESULT, &SyncResult { applied })?)
    }

    async fn roll_back(
        &self,
        operation: &Operation,
        claim: RollbackClaim,
    ) -> Result<Payload, EngineError> {
        let params: RollbackParameters = operation.parameters.decode(schema::ROLLBACK_PARAMETERS)?;
        if claim.target() != &params.target {
            return Err(EngineError::Validation(format!(
                "rollback claim is for {} but parameters name {}",
                claim.target(),
                params.target
            )));
        }
        let report = self.registry.rollback_claimed(claim).await?;
        Ok(Payload::encode(
            schema::ROLLBACK_RESULT,
            &RollbackResult {
                target: report.target,
                reverted: report.reverted,
            },
        )?)
    }

    /// Bound one tracker call by the configured deadline.
    async fn call<T>(
        &self,
        call: impl Future<Output = Result<T, TrackerError>>,
    ) -> Result<T, EngineError> {
        match tokio::time::timeout(self.call_timeout, call).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(EngineError::Timeout(self.call_timeout)),
        }
    }
}
