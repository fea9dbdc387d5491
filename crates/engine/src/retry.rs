use std::future::Future;
use std::time::Duration;

use tracksync_storage::StorageError;

const BACKOFF_STEP: Duration = Duration::from_millis(50);

/// Run a storage call up to `attempts` times, retrying only transient
/// backend failures with linear backoff.
pub(crate) async fn with_retries<T, F, Fut>(
    attempts: u32,
    what: &str,
    mut call: F,
) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < attempts => {
                tracing::warn!(
                    call = what,
                    attempt,
                    error = %e,
                    "storage call failed, retrying"
                );
                tokio::time::sleep(BACKOFF_STEP * attempt).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_backend_errors_until_success() {
        let calls = AtomicU32::new(0);
        let value = with_retries(3, "test", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(StorageError::Backend("disk busy".into()))
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_attempts() {
        let calls = AtomicU32::new(0);
        let err = with_retries(3, "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(StorageError::Backend("down".into()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, StorageError::Backend(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn logical_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let err = with_retries(5, "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(StorageError::OperationNotFound {
                operation_id: "x".into(),
            })
        })
        .await
        .unwrap_err();
        assert!(matches!(err, StorageError::OperationNotFound { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
