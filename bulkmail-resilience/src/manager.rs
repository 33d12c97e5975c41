//! Resilience Manager: the circuit breaker + retry policy composition the
//! scheduler, and where wired in the dispatch engine, execute job/send
//! attempts through.

use std::future::Future;

use bulkmail_common::error::Error;

use crate::breaker::CircuitBreaker;
use crate::retry::RetryPolicy;

/// Routes every attempt through the circuit breaker, and retries the whole
/// breaker-guarded call per the retry policy. A `CircuitOpen` error is not
/// retryable (`is_retryable` only recognizes `Network`/`Temporary`/`Quota`),
/// so an open circuit short-circuits the remaining retry budget rather than
/// spinning against it.
pub struct ResilienceManager {
    breaker: CircuitBreaker,
    retry: RetryPolicy,
}

impl ResilienceManager {
    #[must_use]
    pub fn new(breaker: CircuitBreaker, retry: RetryPolicy) -> Self {
        Self { breaker, retry }
    }

    /// # Errors
    /// Returns the last attempt's error once the retry budget (or `cancel`)
    /// is exhausted, or immediately on a non-retryable classification.
    pub async fn execute<F, Fut, T>(&self, cancel: impl Future<Output = ()>, mut f: F) -> Result<T, Error>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let f_cell = tokio::sync::Mutex::new(&mut f);
        self.retry
            .retry(cancel, |_attempt| {
                let f_cell = &f_cell;
                async move {
                    let mut guard = f_cell.lock().await;
                    self.breaker.call(|| (*guard)()).await
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitBreakerConfig;
    use bulkmail_common::error::ErrorKind;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn succeeds_after_transient_failures_within_budget() {
        let manager = ResilienceManager::new(
            CircuitBreaker::new(CircuitBreakerConfig {
                max_failures: 10,
                timeout: Duration::from_secs(60),
            }),
            RetryPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(10),
                backoff_factor: 2.0,
            },
        );

        let attempts = AtomicU32::new(0);
        let result = manager
            .execute(std::future::pending(), || async {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::transport(ErrorKind::Network, "temporary blip"))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn open_circuit_short_circuits_remaining_retries() {
        let manager = ResilienceManager::new(
            CircuitBreaker::new(CircuitBreakerConfig {
                max_failures: 1,
                timeout: Duration::from_secs(60),
            }),
            RetryPolicy {
                max_retries: 5,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(10),
                backoff_factor: 2.0,
            },
        );

        let attempts = AtomicU32::new(0);
        let result: Result<(), Error> = manager
            .execute(std::future::pending(), || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Error::transport(ErrorKind::Network, "down"))
            })
            .await;

        assert!(matches!(result, Err(Error::CircuitOpen)));
        // One call trips the breaker; the retry loop's next attempt is
        // rejected by the breaker before `f` runs again, so `f` itself
        // never executes the non-retried remaining budget.
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
