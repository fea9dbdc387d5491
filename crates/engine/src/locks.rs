use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-key async mutual exclusion.
///
/// Holding the guard for a key excludes every other holder of the same key;
/// different keys never contend. Idle entries are pruned on the next acquire.
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            // Only the map itself references an idle lock.
            locks.retain(|k, lock| k == key || Arc::strong_count(lock) > 1);
            Arc::clone(
                locks
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    pub(crate) async fn tracked(&self) -> usize {
        self.locks.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_key_is_exclusive() {
        let locks = Arc::new(KeyedLocks::new());
        let guard = locks.acquire("a").await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _g = locks.acquire("a").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let locks = KeyedLocks::new();
        let _a = locks.acquire("a").await;
        let _b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("b"))
            .await
            .expect("lock on another key should be free");
    }

    #[tokio::test]
    async fn idle_keys_are_pruned() {
        let locks = KeyedLocks::new();
        for key in ["a", "b", "c"] {
            drop(locks.acquire(key).await);
        }
        drop(locks.acquire("d").await);
        assert_eq!(locks.tracked().await, 1);
    }
}
