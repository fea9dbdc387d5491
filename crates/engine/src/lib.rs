//! Orchestration engine for long-running tracker sync operations.
//!
//! [`SyncEngine`] is the entry point. It owns the operation registry, the
//! snapshot store, the worker pool, the notification hub, and the reference
//! data cache, all on top of a [`tracksync_storage::SyncStorage`] backend
//! and a [`Tracker`] collaborator.

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod executor;
pub mod hub;
pub mod locks;
pub mod reference;
pub mod registry;
mod retry;
pub mod snapshot;
pub mod tracker;
pub mod types;
pub mod worker;

pub use cache::TtlCache;
pub use config::EngineConfig;
pub use engine::{MaintenanceReport, SyncEngine, DEFAULT_LIST_LIMIT, QUEUE_UNAVAILABLE};
pub use error::{EngineError, RollbackRejection};
pub use hub::{heartbeat_frame, ConnectionHandle, Event, EventKind, NotificationHub, Subscription};
pub use locks::KeyedLocks;
pub use reference::ReferenceLookup;
pub use registry::{OperationRegistry, RegistryParts, RollbackClaim, RollbackEligibility, RollbackReport};
pub use snapshot::SnapshotStore;
pub use tracker::{HttpTracker, Tracker, TrackerEndpoint, TrackerError};
pub use types::{
    schema, EntityState, Mutation, Operation, OperationId, OperationKind, OperationStatus, OwnerId,
    RollbackParameters, RollbackResult, Snapshot, SyncParameters, SyncResult,
};
pub use worker::{Completion, Job, SubmitError, WorkerPool};
