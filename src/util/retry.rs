//! Jittered-backoff retry for the datastore's serializable transactions.
//!
//! Scheduler transaction deadlock policy (error-handling design): retry up
//! to 3x with jittered backoff. This helper is deliberately narrow — it
//! retries only [`BrokerError::Transient`] failures, and re-raises anything
//! else (including `Conflict`, which means the write was rejected for a
//! real reason, not a transient one) on the first attempt.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::{BrokerError, Result};

/// Runs `f` up to `attempts` times, retrying only transient failures with
/// jittered backoff between 100ms and 1s.
pub async fn retry_with_backoff<F, Fut, T>(attempts: u32, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_err: Option<BrokerError> = None;
    for attempt in 0..attempts.max(1) {
        match f().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt + 1 < attempts => {
                let backoff_ms = rand::rng().random_range(100..=1000);
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                last_err = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(last_err.unwrap_or(BrokerError::Transient("retry loop exhausted with no error recorded".into())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let result = retry_with_backoff(3, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(BrokerError::Transient("deadlock".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_non_transient_errors() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = retry_with_backoff(3, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(BrokerError::Conflict("already assigned".into())) }
        })
        .await;
        assert!(matches!(result, Err(BrokerError::Conflict(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
