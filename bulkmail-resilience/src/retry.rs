//! Classifies failures with [`classify`](crate::classify) and retries
//! retryable kinds with exponential backoff plus jitter.

use std::time::Duration;

use bulkmail_common::error::{Error, ErrorKind};
use rand::Rng;

use crate::classifier::classify;

/// Retry policy configuration.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
        }
    }
}

/// `{Network: true, Temporary: true, Quota: true, others: false}`.
#[must_use]
pub fn is_retryable(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::Network | ErrorKind::Temporary | ErrorKind::Quota)
}

impl RetryPolicy {
    /// `delay = min(BaseDelay * BackoffFactor^(attempt-1), MaxDelay) + jitter`
    /// where `jitter` is drawn uniformly from `[0, delay/4)`.
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let scaled = self.base_delay.as_secs_f64() * self.backoff_factor.powi(exponent as i32);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        let base = Duration::from_secs_f64(capped.max(0.0));

        let jitter_bound = base.as_nanos() / 4;
        let jitter_nanos = if jitter_bound == 0 {
            0
        } else {
            rand::rng().random_range(0..jitter_bound)
        };

        base + Duration::from_nanos(jitter_nanos.min(u128::from(u64::MAX)) as u64)
    }

    /// Execute `f`, retrying retryable failures up to `max_retries`
    /// additional times with backoff, respecting cancellation via
    /// `tokio::select!` against `cancel`.
    ///
    /// # Errors
    /// Returns the last error observed: immediately if its kind is not
    /// retryable, otherwise after `max_retries` exhausted attempts or if
    /// `cancel` resolves first.
    pub async fn retry<F, Fut, T>(
        &self,
        cancel: impl std::future::Future<Output = ()>,
        mut f: F,
    ) -> Result<T, Error>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T, Error>>,
    {
        tokio::pin!(cancel);

        let mut attempt = 1;
        loop {
            match f(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    let kind = match &err {
                        Error::Transport { kind, .. } => *kind,
                        other => classify(Some(&other.to_string())),
                    };

                    if !is_retryable(kind) || attempt > self.max_retries {
                        return Err(err);
                    }

                    let delay = self.delay_for_attempt(attempt);
                    tracing::debug!(attempt, ?delay, ?kind, "retrying after classified failure");

                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        () = &mut cancel => return Err(err),
                    }

                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn retryable_kinds_match_spec_defaults() {
        assert!(is_retryable(ErrorKind::Network));
        assert!(is_retryable(ErrorKind::Temporary));
        assert!(is_retryable(ErrorKind::Quota));
        assert!(!is_retryable(ErrorKind::Auth));
        assert!(!is_retryable(ErrorKind::Permanent));
        assert!(!is_retryable(ErrorKind::Unknown));
    }

    #[test]
    fn delay_grows_exponentially_and_caps_at_max_delay() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
        };

        // attempt 1: base ~100ms (+ up to 25ms jitter)
        let d1 = policy.delay_for_attempt(1);
        assert!(d1 >= Duration::from_millis(100) && d1 < Duration::from_millis(125));

        // attempt 4: 100ms * 2^3 = 800ms
        let d4 = policy.delay_for_attempt(4);
        assert!(d4 >= Duration::from_millis(800) && d4 < Duration::from_millis(1000));

        // attempt 10 would blow past max_delay without capping.
        let d10 = policy.delay_for_attempt(10);
        assert!(d10 >= Duration::from_secs(1) && d10 < Duration::from_millis(1250));
    }

    #[tokio::test]
    async fn non_retryable_kind_returns_immediately() {
        let policy = RetryPolicy::default();
        let attempts = AtomicU32::new(0);

        let result: Result<(), Error> = policy
            .retry(std::future::pending(), |_attempt| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::transport(ErrorKind::Auth, "authentication failed")) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retryable_kind_retries_up_to_max_then_gives_up() {
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_factor: 2.0,
        };
        let attempts = AtomicU32::new(0);

        let result: Result<(), Error> = policy
            .retry(std::future::pending(), |_attempt| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::transport(ErrorKind::Network, "connection refused")) }
            })
            .await;

        assert!(result.is_err());
        // initial attempt + 2 retries = 3 total
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failure() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            backoff_factor: 2.0,
        };
        let attempts = AtomicU32::new(0);

        let result = policy
            .retry(std::future::pending(), |_attempt| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(Error::transport(ErrorKind::Temporary, "mailbox unavailable"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancellation_aborts_retry_loop() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            backoff_factor: 1.0,
        };

        let result: Result<(), Error> = policy
            .retry(
                async { /* cancel immediately */ },
                |_attempt| async { Err(Error::transport(ErrorKind::Network, "timeout")) },
            )
            .await;

        assert!(result.is_err());
    }
}
