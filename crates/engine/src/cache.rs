use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::locks::KeyedLocks;

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

/// In-process key/value cache with per-entry TTL and single-flight loading.
///
/// Expired entries are invisible to readers immediately and are physically
/// removed lazily on read or by [`TtlCache::sweep`].
pub struct TtlCache<V> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    loads: KeyedLocks,
}

impl<V: Clone + Send> TtlCache<V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            loads: KeyedLocks::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, key: &str, value: V, ttl: Duration) {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    pub fn invalidate(&self, key: &str) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.remove(key).is_some()
    }

    /// Return the cached value, or run `load` and cache its result.
    ///
    /// At most one load per key runs at a time. Callers that arrive while a
    /// load is in flight wait for it and then read its value. If the load
    /// fails nothing is cached and the error goes to that caller only; the
    /// next waiter runs its own load.
    pub async fn get_or_load<F, Fut, E>(&self, key: &str, ttl: Duration, load: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }
        let _loading = self.loads.acquire(key).await;
        if let Some(value) = self.get(key) {
            return Ok(value);
        }
        let value = load().await?;
        self.set(key, value.clone(), ttl);
        Ok(value)
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone + Send> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new()
    }
}
