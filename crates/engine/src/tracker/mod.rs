//! The collaborator seam: the ticket trackers the engine mutates.
//!
//! The engine only sees [`Tracker`]. [`HttpTracker`] talks to real tracker
//! services; tests substitute an in-memory fake.

mod http;

pub use http::{HttpTracker, TrackerEndpoint};

use async_trait::async_trait;
use serde_json::Value;
use tracksync_storage::EntityRef;

use crate::types::{EntityState, OwnerId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackerError {
    #[error("no tracker configured for system '{0}'")]
    UnknownSystem(String),

    #[error("tracker '{system}' request failed: {message}")]
    Request { system: String, message: String },

    #[error("tracker '{system}' returned HTTP {status}")]
    Status { system: String, status: u16 },

    #[error("tracker '{system}' sent an invalid payload: {message}")]
    InvalidPayload { system: String, message: String },
}

/// Read and write access to entities in the external trackers.
///
/// Calls may be slow or hang; the engine bounds each one with its own
/// deadline.
#[async_trait]
pub trait Tracker: Send + Sync + 'static {
    /// Current state of one entity. A missing entity is `Absent`, not an error.
    async fn fetch_entity(&self, entity: &EntityRef) -> Result<EntityState, TrackerError>;

    /// Make the entity match `state`. `Absent` deletes it. Applying the same
    /// state twice leaves the same result.
    async fn apply_mutation(&self, entity: &EntityRef, state: &EntityState)
        -> Result<(), TrackerError>;

    /// Reference data (projects, users, ...) of one kind, scoped to the owner.
    async fn fetch_reference(
        &self,
        system: &str,
        kind: &str,
        owner_id: &OwnerId,
    ) -> Result<Value, TrackerError>;
}

/// Check that `value` can be placed verbatim into a tracker URL as one
/// path segment. Ids are not percent-encoded on the way out.
pub(crate) fn check_path_segment(field: &str, value: &str) -> Result<(), String> {
    if value.is_empty() {
        return Err(format!("{field} must not be empty"));
    }
    if let Some(c) = value
        .chars()
        .find(|c| matches!(c, '/' | '?' | '#' | '%') || c.is_whitespace() || c.is_control())
    {
        return Err(format!("{field} must not contain {c:?}"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::check_path_segment;

    #[test]
    fn path_segments_reject_url_syntax() {
        assert!(check_path_segment("entity_id", "PROJ-12").is_ok());
        for bad in ["", "a/b", "a?b", "a#b", "50%", "two words", "tab\there"] {
            assert!(check_path_segment("entity_id", bad).is_err(), "{bad:?} accepted");
        }
    }
}
