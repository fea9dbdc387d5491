use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::StorageError;

/// An opaque, schema-tagged payload.
///
/// Only the component that understands `schema` decodes `bytes`; storage
/// treats both as opaque. `bytes` is base64 text when the record itself is
/// serialized (flat-file backend, wire formats).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub schema: String,
    #[serde(serialize_with = "encode_b64", deserialize_with = "decode_b64")]
    pub bytes: Vec<u8>,
}

impl Payload {
    /// Encode `value` as JSON bytes under the given schema tag.
    pub fn encode<T: Serialize>(schema: &str, value: &T) -> Result<Self, StorageError> {
        Ok(Payload {
            schema: schema.to_string(),
            bytes: serde_json::to_vec(value)?,
        })
    }

    /// Decode the bytes, refusing payloads tagged with a different schema.
    pub fn decode<T: DeserializeOwned>(&self, schema: &str) -> Result<T, StorageError> {
        if self.schema != schema {
            return Err(StorageError::Serialization(format!(
                "expected payload schema '{}', found '{}'",
                schema, self.schema
            )));
        }
        Ok(serde_json::from_slice(&self.bytes)?)
    }

    /// Decode the bytes as untyped JSON regardless of schema.
    pub fn to_json(&self) -> Result<serde_json::Value, StorageError> {
        Ok(serde_json::from_slice(&self.bytes)?)
    }
}

fn encode_b64<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
}

fn decode_b64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let text = String::deserialize(deserializer)?;
    base64::engine::general_purpose::STANDARD
        .decode(text.as_bytes())
        .map_err(serde::de::Error::custom)
}

/// Identifies one entity in one of the ticket trackers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    /// The tracker the entity lives in (e.g. `"youtrack"`, `"jira"`).
    pub system: String,
    pub entity_type: String,
    pub entity_id: String,
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}/{}", self.system, self.entity_type, self.entity_id)
    }
}

/// A stored operation, the unit of mutual exclusion in the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: String,
    pub owner_id: String,
    pub kind: String,
    pub status: String,
    pub parameters: Payload,
    /// Present only once the operation reached a terminal status.
    pub result: Option<Payload>,
    pub failure_reason: Option<String>,
    /// OCC counter, starts at 0 and increments on every update.
    pub version: i64,
    /// Fixed-width UTC timestamp, see [`crate::format_timestamp`].
    pub created_at: String,
    pub updated_at: String,
}

/// The pre-mutation state of one entity, captured before the mutation is
/// issued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub operation_id: String,
    /// Strictly increasing within one operation, starting at 1.
    pub sequence: i64,
    pub entity: EntityRef,
    /// `None` when the entity did not exist before the mutation.
    pub before_state: Option<Payload>,
    pub captured_at: String,
}

/// One append-only audit trail entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: String,
    pub operation_id: String,
    pub actor: String,
    pub action: String,
    pub outcome: String,
    pub detail: Option<String>,
    pub recorded_at: String,
}
