use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracksync_storage::Payload;

use crate::executor::Executor;
use crate::registry::RollbackClaim;
use crate::types::{Operation, OperationId, OperationKind, OwnerId};

/// A unit of work handed to the pool.
pub struct Job {
    pub operation: Operation,
    pub(crate) claim: Option<RollbackClaim>,
}

impl Job {
    pub fn new(operation: Operation) -> Self {
        Self {
            operation,
            claim: None,
        }
    }

    pub(crate) fn rollback(operation: Operation, claim: RollbackClaim) -> Self {
        Self {
            operation,
            claim: Some(claim),
        }
    }
}

/// Reported once per job, after its work has finished.
#[derive(Debug)]
pub struct Completion {
    pub operation_id: OperationId,
    pub owner_id: OwnerId,
    pub kind: OperationKind,
    pub outcome: Result<Payload, String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("worker queue is full")]
    Full,
    #[error("worker pool has shut down")]
    Closed,
}

/// Bounded queue feeding at most `workers` concurrent jobs.
pub struct WorkerPool {
    jobs: mpsc::Sender<Job>,
}

impl WorkerPool {
    /// Spawn the dispatcher. Completions arrive on the returned receiver.
    pub fn start(
        executor: Arc<Executor>,
        workers: usize,
        queue_depth: usize,
    ) -> (Self, mpsc::UnboundedReceiver<Completion>, JoinHandle<()>) {
        let (jobs, mut queue) = mpsc::channel::<Job>(queue_depth.max(1));
        let (completions, completed) = mpsc::unbounded_channel();
        let slots = Arc::new(Semaphore::new(workers.max(1)));

        let dispatcher = tokio::spawn(async move {
            while let Some(job) = queue.recv().await {
                let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
                    break;
                };
                let executor = Arc::clone(&executor);
                let completions = completions.clone();
                tokio::spawn(async move {
                    let operation_id = job.operation.id;
                    let owner_id = job.operation.owner_id.clone();
                    let kind = job.operation.kind;

                    // A panicking job must still produce a completion.
                    let outcome = match tokio::spawn(async move { executor.run(job).await }).await {
                        Ok(outcome) => outcome,
                        Err(e) => {
                            tracing::error!(operation_id = %operation_id, error = %e, "worker task aborted");
                            Err(format!("worker task aborted: {e}"))
                        }
                    };
                    drop(permit);
                    if completions
                        .send(Completion {
                            operation_id,
                            owner_id,
                            kind,
                            outcome,
                        })
                        .is_err()
                    {
                        tracing::warn!(operation_id = %operation_id, "completion dropped, no listener");
                    }
                });
            }
            tracing::debug!("worker dispatcher stopped");
        });

        (WorkerPool { jobs }, completed, dispatcher)
    }

    /// Queue a job without waiting. On error the job is dropped, which
    /// releases any rollback claim it carried.
    pub fn submit(&self, job: Job) -> Result<(), SubmitError> {
        self.jobs.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SubmitError::Full,
            mpsc::error::TrySendError::Closed(_) => SubmitError::Closed,
        })
    }
}
