use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracksync_storage::now_timestamp;

use crate::types::{OperationId, OwnerId};

/// What happened to an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    OperationStarted,
    OperationProgress { percent: u8, message: String },
    OperationCompleted { result: Value },
    OperationFailed { reason: String },
    RollbackStarted,
    RollbackCompleted { reverted: usize },
    RollbackFailed { reason: String },
}

impl EventKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            EventKind::OperationStarted => "operation_started",
            EventKind::OperationProgress { .. } => "operation_progress",
            EventKind::OperationCompleted { .. } => "operation_completed",
            EventKind::OperationFailed { .. } => "operation_failed",
            EventKind::RollbackStarted => "rollback_started",
            EventKind::RollbackCompleted { .. } => "rollback_completed",
            EventKind::RollbackFailed { .. } => "rollback_failed",
        }
    }

    fn data(&self) -> Value {
        match self {
            EventKind::OperationStarted | EventKind::RollbackStarted => json!({}),
            EventKind::OperationProgress { percent, message } => {
                json!({ "percent": percent, "message": message })
            }
            EventKind::OperationCompleted { result } => json!({ "result": result }),
            EventKind::OperationFailed { reason } | EventKind::RollbackFailed { reason } => {
                json!({ "reason": reason })
            }
            EventKind::RollbackCompleted { reverted } => json!({ "reverted": reverted }),
        }
    }
}

/// A notification about one operation, addressed to its owner.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub operation_id: OperationId,
    pub kind: EventKind,
    pub timestamp: String,
}

impl Event {
    pub fn new(operation_id: OperationId, kind: EventKind) -> Self {
        Self {
            operation_id,
            kind,
            timestamp: now_timestamp(),
        }
    }

    /// The frame sent to clients: `{type, operation_id, data, timestamp}`.
    pub fn to_wire(&self) -> Value {
        json!({
            "type": self.kind.type_name(),
            "operation_id": self.operation_id.to_string(),
            "data": self.kind.data(),
            "timestamp": self.timestamp,
        })
    }
}

/// The keep-alive frame.
pub fn heartbeat_frame() -> Value {
    json!({ "type": "heartbeat" })
}

/// Identifies one registered connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionHandle {
    pub owner_id: OwnerId,
    pub id: u64,
}

/// A registered connection's receiving side. The stream ends when the hub
/// drops the connection (unregister or heartbeat timeout).
pub struct Subscription {
    pub handle: ConnectionHandle,
    pub events: mpsc::UnboundedReceiver<Event>,
}

struct Connection {
    id: u64,
    sender: mpsc::UnboundedSender<Event>,
    last_seen: Instant,
}

#[derive(Default)]
struct HubState {
    next_id: u64,
    owners: HashMap<OwnerId, Vec<Connection>>,
}

/// Fan-out of operation events to the live connections of each owner.
///
/// Delivery is best-effort: events for an owner with no connections are
/// dropped. Events published for one owner reach each of that owner's
/// connections in publish order.
pub struct NotificationHub {
    state: Mutex<HubState>,
    heartbeat_timeout: Duration,
}

impl NotificationHub {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(HubState::default()),
            heartbeat_timeout,
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn register(&self, owner_id: &OwnerId) -> Subscription {
        let (sender, events) = mpsc::unbounded_channel();
        let mut state = self.state();
        state.next_id += 1;
        let id = state.next_id;
        state
            .owners
            .entry(owner_id.clone())
            .or_default()
            .push(Connection {
                id,
                sender,
                last_seen: Instant::now(),
            });
        tracing::debug!(owner_id = %owner_id, connection = id, "connection registered");
        Subscription {
            handle: ConnectionHandle {
                owner_id: owner_id.clone(),
                id,
            },
            events,
        }
    }

    /// Remove a connection. Returns false if it was already gone.
    pub fn unregister(&self, handle: &ConnectionHandle) -> bool {
        let mut state = self.state();
        let Some(connections) = state.owners.get_mut(&handle.owner_id) else {
            return false;
        };
        let before = connections.len();
        connections.retain(|c| c.id != handle.id);
        let removed = connections.len() < before;
        if connections.is_empty() {
            state.owners.remove(&handle.owner_id);
        }
        if removed {
            tracing::debug!(owner_id = %handle.owner_id, connection = handle.id, "connection unregistered");
        }
        removed
    }

    /// Record liveness for a connection. Returns false if the hub no longer
    /// knows it.
    pub fn touch(&self, handle: &ConnectionHandle) -> bool {
        let mut state = self.state();
        let Some(connection) = state
            .owners
            .get_mut(&handle.owner_id)
            .and_then(|cs| cs.iter_mut().find(|c| c.id == handle.id))
        else {
            return false;
        };
        connection.last_seen = Instant::now();
        true
    }

    /// Deliver `event` to every live connection of `owner_id`. Connections
    /// whose receiver is gone are removed. Returns the number delivered.
    pub fn publish(&self, owner_id: &OwnerId, event: Event) -> usize {
        let mut state = self.state();
        let Some(connections) = state.owners.get_mut(owner_id) else {
            tracing::trace!(owner_id = %owner_id, event = event.kind.type_name(), "no listeners");
            return 0;
        };
        connections.retain(|c| c.sender.send(event.clone()).is_ok());
        let delivered = connections.len();
        if connections.is_empty() {
            state.owners.remove(owner_id);
        }
        delivered
    }

    /// Drop connections with no liveness signal within the heartbeat timeout.
    pub fn reap_idle(&self) -> Vec<ConnectionHandle> {
        let now = Instant::now();
        let mut reaped = Vec::new();
        let mut state = self.state();
        for (owner_id, connections) in state.owners.iter_mut() {
            connections.retain(|c| {
                let alive = now.duration_since(c.last_seen) < self.heartbeat_timeout
                    && !c.sender.is_closed();
                if !alive {
                    reaped.push(ConnectionHandle {
                        owner_id: owner_id.clone(),
                        id: c.id,
                    });
                }
                alive
            });
        }
        state.owners.retain(|_, connections| !connections.is_empty());
        for handle in &reaped {
            tracing::info!(owner_id = %handle.owner_id, connection = handle.id, "connection reaped");
        }
        reaped
    }

    pub fn connection_count(&self, owner_id: &OwnerId) -> usize {
        self.state().owners.get(owner_id).map_or(0, Vec::len)
    }
}
