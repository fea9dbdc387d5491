//! Domain types: operations, their lifecycle, snapshots, and payload schemas.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracksync_storage::{EntityRef, OperationRecord, Payload, SnapshotRecord, StorageError};
use uuid::Uuid;

/// Schema tags for the payloads the engine itself encodes and decodes.
pub mod schema {
    pub const SYNC_PARAMETERS: &str = "sync.parameters/1";
    pub const SYNC_RESULT: &str = "sync.result/1";
    pub const ROLLBACK_PARAMETERS: &str = "rollback.parameters/1";
    pub const ROLLBACK_RESULT: &str = "rollback.result/1";
    pub const ENTITY_STATE: &str = "entity.state/1";
}

// ──────────────────────────────────────────────
// Identifiers
// ──────────────────────────────────────────────

/// Operation identifier: a UUIDv7, so ids sort by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(Uuid);

impl OperationId {
    pub fn new() -> Self {
        OperationId(Uuid::now_v7())
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.hyphenated().fmt(f)
    }
}

impl FromStr for OperationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(OperationId)
    }
}

/// Opaque identity of the user an operation belongs to.
///
/// Issued by the external auth layer; the engine only compares it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    /// Returns `None` for an empty or whitespace-only id.
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            None
        } else {
            Some(OwnerId(id))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ──────────────────────────────────────────────
// Kind and status
// ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Sync,
    Create,
    Rollback,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Sync => "sync",
            OperationKind::Create => "create",
            OperationKind::Rollback => "rollback",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sync" => Ok(OperationKind::Sync),
            "create" => Ok(OperationKind::Create),
            "rollback" => Ok(OperationKind::Rollback),
            other => Err(format!("unknown operation kind '{other}'")),
        }
    }
}

/// Lifecycle status of an operation.
///
/// ```text
/// pending -> in_progress -> completed -> rolled_back
///                        \-> failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

impl OperationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::InProgress => "in_progress",
            OperationStatus::Completed => "completed",
            OperationStatus::Failed => "failed",
            OperationStatus::RolledBack => "rolled_back",
        }
    }

    /// The allowed-edge table. Everything not listed is illegal.
    pub fn can_transition_to(self, next: OperationStatus) -> bool {
        use OperationStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (Completed, RolledBack)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationStatus::Completed | OperationStatus::Failed | OperationStatus::RolledBack
        )
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(OperationStatus::Pending),
            "in_progress" => Ok(OperationStatus::InProgress),
            "completed" => Ok(OperationStatus::Completed),
            "failed" => Ok(OperationStatus::Failed),
            "rolled_back" => Ok(OperationStatus::RolledBack),
            other => Err(format!("unknown operation status '{other}'")),
        }
    }
}

// ──────────────────────────────────────────────
// Operation
// ──────────────────────────────────────────────

/// One long-running unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub id: OperationId,
    pub owner_id: OwnerId,
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub parameters: Payload,
    pub result: Option<Payload>,
    pub failure_reason: Option<String>,
    pub version: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl Operation {
    pub fn to_record(&self) -> OperationRecord {
        OperationRecord {
            id: self.id.to_string(),
            owner_id: self.owner_id.as_str().to_string(),
            kind: self.kind.as_str().to_string(),
            status: self.status.as_str().to_string(),
            parameters: self.parameters.clone(),
            result: self.result.clone(),
            failure_reason: self.failure_reason.clone(),
            version: self.version,
            created_at: self.created_at.clone(),
            updated_at: self.updated_at.clone(),
        }
    }

    /// JSON view for the REST surface, with payloads decoded.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id.to_string(),
            "owner_id": self.owner_id.as_str(),
            "kind": self.kind.as_str(),
            "status": self.status.as_str(),
            "parameters": payload_json(Some(&self.parameters)),
            "result": payload_json(self.result.as_ref()),
            "failure_reason": self.failure_reason,
            "created_at": self.created_at,
            "updated_at": self.updated_at,
        })
    }
}

fn payload_json(payload: Option<&Payload>) -> serde_json::Value {
    match payload {
        Some(p) => p.to_json().unwrap_or_else(|_| {
            serde_json::json!({ "schema": p.schema, "undecodable": true })
        }),
        None => serde_json::Value::Null,
    }
}

impl TryFrom<OperationRecord> for Operation {
    type Error = StorageError;

    fn try_from(record: OperationRecord) -> Result<Self, Self::Error> {
        let corrupt = |field: &str, msg: String| {
            StorageError::Serialization(format!(
                "operation {} has invalid {field}: {msg}",
                record.id
            ))
        };
        let id = record
            .id
            .parse()
            .map_err(|e: uuid::Error| corrupt("id", e.to_string()))?;
        let owner_id =
            OwnerId::new(record.owner_id.clone()).ok_or_else(|| corrupt("owner_id", "empty".into()))?;
        let kind = record.kind.parse().map_err(|e| corrupt("kind", e))?;
        let status = record.status.parse().map_err(|e| corrupt("status", e))?;
        Ok(Operation {
            id,
            owner_id,
            kind,
            status,
            parameters: record.parameters,
            result: record.result,
            failure_reason: record.failure_reason,
            version: record.version,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }
}

// ──────────────────────────────────────────────
// Entity state and snapshots
// ──────────────────────────────────────────────

/// The state of one tracker entity, as read before or written by a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityState {
    Present(Payload),
    /// The entity does not exist. Applying `Absent` deletes it.
    Absent,
}

impl EntityState {
    /// Wrap a JSON document as a present entity state.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, StorageError> {
        Ok(EntityState::Present(Payload::encode(schema::ENTITY_STATE, value)?))
    }

    pub fn from_option(payload: Option<Payload>) -> Self {
        match payload {
            Some(p) => EntityState::Present(p),
            None => EntityState::Absent,
        }
    }

    pub fn into_option(self) -> Option<Payload> {
        match self {
            EntityState::Present(p) => Some(p),
            EntityState::Absent => None,
        }
    }

    pub fn as_payload(&self) -> Option<&Payload> {
        match self {
            EntityState::Present(p) => Some(p),
            EntityState::Absent => None,
        }
    }
}

/// Pre-mutation state of one entity, scoped to an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub operation_id: OperationId,
    pub sequence: i64,
    pub entity: EntityRef,
    pub before_state: EntityState,
    pub captured_at: String,
}

impl TryFrom<SnapshotRecord> for Snapshot {
    type Error = StorageError;

    fn try_from(record: SnapshotRecord) -> Result<Self, Self::Error> {
        let operation_id = record.operation_id.parse().map_err(|e: uuid::Error| {
            StorageError::Serialization(format!(
                "snapshot has invalid operation id '{}': {e}",
                record.operation_id
            ))
        })?;
        Ok(Snapshot {
            operation_id,
            sequence: record.sequence,
            entity: record.entity,
            before_state: EntityState::from_option(record.before_state),
            captured_at: record.captured_at,
        })
    }
}

// ──────────────────────────────────────────────
// Payload bodies
// ──────────────────────────────────────────────

/// Body of `sync.parameters/1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncParameters {
    pub mutations: Vec<Mutation>,
}

/// One entity write. `state: null` deletes the entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub target: EntityRef,
    #[serde(default)]
    pub state: Option<serde_json::Value>,
}

/// Body of `sync.result/1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub applied: Vec<EntityRef>,
}

/// Body of `rollback.parameters/1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackParameters {
    pub target: OperationId,
}

/// Body of `rollback.result/1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackResult {
    pub target: OperationId,
    pub reverted: Vec<EntityRef>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use OperationStatus::*;

    const ALL: [OperationStatus; 5] = [Pending, InProgress, Completed, Failed, RolledBack];

    #[test]
    fn only_listed_edges_are_allowed() {
        let allowed = [
            (Pending, InProgress),
            (InProgress, Completed),
            (InProgress, Failed),
            (Completed, RolledBack),
        ];
        for from in ALL {
            for to in ALL {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn status_strings_round_trip() {
        for status in ALL {
            assert_eq!(status.as_str().parse::<OperationStatus>(), Ok(status));
        }
        assert!("done".parse::<OperationStatus>().is_err());
    }

    #[test]
    fn owner_id_rejects_blank() {
        assert!(OwnerId::new("  ").is_none());
        assert_eq!(OwnerId::new("7").map(|o| o.to_string()), Some("7".to_string()));
    }

    #[test]
    fn operation_ids_sort_by_creation() {
        let first = OperationId::new();
        let second = OperationId::new();
        assert!(first.to_string() < second.to_string() || first == second);
    }

    #[test]
    fn corrupt_status_is_a_serialization_error() {
        let record = OperationRecord {
            id: OperationId::new().to_string(),
            owner_id: "7".to_string(),
            kind: "sync".to_string(),
            status: "exploded".to_string(),
            parameters: Payload {
                schema: schema::SYNC_PARAMETERS.to_string(),
                bytes: b"{}".to_vec(),
            },
            result: None,
            failure_reason: None,
            version: 0,
            created_at: String::new(),
            updated_at: String::new(),
        };
        assert!(matches!(
            Operation::try_from(record),
            Err(StorageError::Serialization(_))
        ));
    }
}
