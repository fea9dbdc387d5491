use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::cache::TtlCache;
use crate::error::EngineError;
use crate::tracker::{check_path_segment, Tracker};
use crate::types::OwnerId;

/// Cached, owner-scoped reference data (projects, users, ...) from the
/// trackers. Concurrent misses for the same key share one fetch.
pub struct ReferenceLookup {
    tracker: Arc<dyn Tracker>,
    cache: Arc<TtlCache<Value>>,
    ttl: Duration,
    call_timeout: Duration,
}

impl ReferenceLookup {
    pub fn new(
        tracker: Arc<dyn Tracker>,
        cache: Arc<TtlCache<Value>>,
        ttl: Duration,
        call_timeout: Duration,
    ) -> Self {
        Self {
            tracker,
            cache,
            ttl,
            call_timeout,
        }
    }

    /// Cache key: `<owner>/<system>-<kind>`. `system` never contains `-`
    /// and neither segment contains `/`, so distinct lookups never share a key.
    pub fn cache_key(owner_id: &OwnerId, system: &str, kind: &str) -> String {
        format!("{owner_id}/{system}-{kind}")
    }

    pub async fn get(
        &self,
        owner_id: &OwnerId,
        system: &str,
        kind: &str,
    ) -> Result<Value, EngineError> {
        validate_segments(system, kind)?;
        let key = Self::cache_key(owner_id, system, kind);
        self.cache
            .get_or_load(&key, self.ttl, || async {
                tracing::debug!(key = %key, "reference cache miss");
                match tokio::time::timeout(
                    self.call_timeout,
                    self.tracker.fetch_reference(system, kind, owner_id),
                )
                .await
                {
                    Ok(fetched) => fetched.map_err(EngineError::from),
                    Err(_) => Err(EngineError::Timeout(self.call_timeout)),
                }
            })
            .await
    }

    /// Drop a cached entry so the next read refetches. Returns whether one
    /// was present.
    pub fn invalidate(&self, owner_id: &OwnerId, system: &str, kind: &str) -> bool {
        self.cache
            .invalidate(&Self::cache_key(owner_id, system, kind))
    }
}

fn validate_segments(system: &str, kind: &str) -> Result<(), EngineError> {
    check_path_segment("system", system).map_err(EngineError::Validation)?;
    check_path_segment("kind", kind).map_err(EngineError::Validation)?;
    if system.contains('-') {
        return Err(EngineError::Validation(
            "system must not contain '-'".to_string(),
        ));
    }
    Ok(())
}
