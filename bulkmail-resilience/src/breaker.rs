//! A three-state breaker (Closed/Open/HalfOpen) guarding a single protected
//! resource (an SMTP session pool, or the scheduler's resilience manager
//! wrapping a job handler). The dispatch engine and the scheduler each own
//! one breaker instance rather than partitioning by destination domain.

use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use bulkmail_common::error::{Error, ErrorKind};
use parking_lot::Mutex;

use crate::classifier::classify;

const ERROR_RING_CAPACITY: usize = 100;

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures required to open the circuit. Default: 5.
    pub max_failures: u32,
    /// How long the circuit stays open before probing recovery. Default: 60s.
    pub timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// `resetTimeout = 2 * timeout`, used when a HalfOpen probe fails.
    #[must_use]
    pub fn reset_timeout(&self) -> Duration {
        self.timeout * 2
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failures: u32,
    next_attempt: Option<Instant>,
    kind_counts: [u64; 6],
    recent_errors: VecDeque<String>,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            next_attempt: None,
            kind_counts: [0; 6],
            recent_errors: VecDeque::with_capacity(ERROR_RING_CAPACITY),
        }
    }

    fn kind_index(kind: ErrorKind) -> usize {
        match kind {
            ErrorKind::Network => 0,
            ErrorKind::Auth => 1,
            ErrorKind::Quota => 2,
            ErrorKind::Temporary => 3,
            ErrorKind::Permanent => 4,
            ErrorKind::Unknown => 5,
        }
    }

    fn record_error_text(&mut self, text: &str) {
        if self.recent_errors.len() >= ERROR_RING_CAPACITY {
            self.recent_errors.pop_front();
        }
        self.recent_errors.push_back(text.to_string());
    }
}

/// A snapshot of circuit breaker state, safe to hand to callers without
/// exposing the internal mutex.
#[derive(Debug, Clone)]
pub struct CircuitBreakerSnapshot {
    pub state: CircuitState,
    pub failures: u32,
    pub kind_counts: ahash_like::KindCounts,
    pub recent_errors: Vec<String>,
}

/// A tiny stand-in module so `CircuitBreakerSnapshot` doesn't need an extra
/// dependency for a six-field struct.
pub mod ahash_like {
    use bulkmail_common::error::ErrorKind;

    #[derive(Debug, Clone, Default)]
    pub struct KindCounts {
        pub network: u64,
        pub auth: u64,
        pub quota: u64,
        pub temporary: u64,
        pub permanent: u64,
        pub unknown: u64,
    }

    impl KindCounts {
        #[must_use]
        pub const fn get(&self, kind: ErrorKind) -> u64 {
            match kind {
                ErrorKind::Network => self.network,
                ErrorKind::Auth => self.auth,
                ErrorKind::Quota => self.quota,
                ErrorKind::Temporary => self.temporary,
                ErrorKind::Permanent => self.permanent,
                ErrorKind::Unknown => self.unknown,
            }
        }
    }
}

/// The circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner::new()),
        }
    }

    /// Execute `fn`, routing its outcome through the breaker's state
    /// machine.
    ///
    /// # Errors
    /// Returns `Error::CircuitOpen` without calling `f` if the circuit is
    /// open and the timeout has not elapsed; otherwise returns whatever `f`
    /// returns.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, Error>>,
    {
        if !self.should_allow() {
            return Err(Error::CircuitOpen);
        }

        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure(&err);
                Err(err)
            }
        }
    }

    /// Decides whether a request may proceed right now, transitioning
    /// Open→HalfOpen if the timeout has elapsed.
    fn should_allow(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Open => {
                let next_attempt = inner.next_attempt.unwrap_or_else(Instant::now);
                if Instant::now() >= next_attempt {
                    inner.state = CircuitState::HalfOpen;
                    tracing::info!("circuit breaker entering half-open, allowing one probe");
                    true
                } else {
                    false
                }
            }
            CircuitState::Closed | CircuitState::HalfOpen => true,
        }
    }

    fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failures = 0;
                inner.next_attempt = None;
                tracing::info!("circuit breaker closed after successful probe");
            }
            CircuitState::Closed => {
                inner.failures = inner.failures.saturating_sub(1);
            }
            CircuitState::Open => {
                // A success should not be observable while open; ignore.
            }
        }
    }

    fn record_failure(&self, err: &Error) {
        let kind = match err {
            Error::Transport { kind, .. } => *kind,
            other => classify(Some(&other.to_string())),
        };

        let mut inner = self.inner.lock();
        inner.kind_counts[Inner::kind_index(kind)] += 1;
        inner.record_error_text(&err.to_string());

        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.max_failures {
                    inner.state = CircuitState::Open;
                    inner.next_attempt = Some(Instant::now() + self.config.timeout);
                    tracing::warn!(
                        failures = inner.failures,
                        "circuit breaker opened after consecutive failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.next_attempt = Some(Instant::now() + self.config.reset_timeout());
                tracing::warn!("circuit breaker probe failed, reopening");
            }
            CircuitState::Open => {
                // Already open.
            }
        }
    }

    /// Returns a snapshot copy of the breaker's state.
    #[must_use]
    pub fn get_state(&self) -> CircuitBreakerSnapshot {
        let inner = self.inner.lock();
        CircuitBreakerSnapshot {
            state: inner.state,
            failures: inner.failures,
            kind_counts: ahash_like::KindCounts {
                network: inner.kind_counts[0],
                auth: inner.kind_counts[1],
                quota: inner.kind_counts[2],
                temporary: inner.kind_counts[3],
                permanent: inner.kind_counts[4],
                unknown: inner.kind_counts[5],
            },
            recent_errors: inner.recent_errors.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_failures: u32, timeout: Duration) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            max_failures,
            timeout,
        }
    }

    #[tokio::test]
    async fn opens_after_consecutive_failures() {
        let breaker = CircuitBreaker::new(config(3, Duration::from_secs(60)));

        for _ in 0..3 {
            let result: Result<(), Error> = breaker
                .call(|| async { Err(Error::transport(ErrorKind::Network, "connection refused")) })
                .await;
            assert!(result.is_err());
        }

        assert_eq!(breaker.get_state().state, CircuitState::Open);

        // A fourth call must not even invoke the closure.
        let invoked = std::sync::atomic::AtomicBool::new(false);
        let result = breaker
            .call(|| {
                invoked.store(true, std::sync::atomic::Ordering::SeqCst);
                async { Ok::<(), Error>(()) }
            })
            .await;
        assert!(matches!(result, Err(Error::CircuitOpen)));
        assert!(!invoked.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn half_open_probe_admits_exactly_one_request() {
        let breaker = CircuitBreaker::new(config(1, Duration::from_millis(10)));

        let _: Result<(), Error> = breaker
            .call(|| async { Err(Error::transport(ErrorKind::Network, "timeout")) })
            .await;
        assert_eq!(breaker.get_state().state, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(15)).await;

        // should_allow() flips Open -> HalfOpen on the first check.
        assert!(breaker.should_allow());
        assert_eq!(breaker.get_state().state, CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn half_open_success_closes_circuit() {
        let breaker = CircuitBreaker::new(config(1, Duration::from_millis(5)));
        let _: Result<(), Error> = breaker
            .call(|| async { Err(Error::transport(ErrorKind::Network, "timeout")) })
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let result: Result<(), Error> = breaker.call(|| async { Ok(()) }).await;
        assert!(result.is_ok());
        assert_eq!(breaker.get_state().state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_circuit() {
        let breaker = CircuitBreaker::new(config(1, Duration::from_millis(5)));
        let _: Result<(), Error> = breaker
            .call(|| async { Err(Error::transport(ErrorKind::Network, "timeout")) })
            .await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        let result: Result<(), Error> = breaker
            .call(|| async { Err(Error::transport(ErrorKind::Network, "timeout again")) })
            .await;
        assert!(result.is_err());
        assert_eq!(breaker.get_state().state, CircuitState::Open);
    }

    #[tokio::test]
    async fn a_connection_refused_mock_trips_after_three_failures_then_short_circuits_for_one_second() {
        let breaker = CircuitBreaker::new(config(3, Duration::from_secs(1)));
        let mock_calls = std::sync::atomic::AtomicU32::new(0);

        for _ in 0..3 {
            let result: Result<(), Error> = breaker
                .call(|| {
                    mock_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    async { Err(Error::transport(ErrorKind::Network, "connection refused")) }
                })
                .await;
            assert!(matches!(result, Err(Error::Transport { kind: ErrorKind::Network, .. })));
        }
        assert_eq!(mock_calls.load(std::sync::atomic::Ordering::SeqCst), 3);

        for _ in 0..5 {
            let result: Result<(), Error> = breaker
                .call(|| {
                    mock_calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    async { Err(Error::transport(ErrorKind::Network, "connection refused")) }
                })
                .await;
            assert!(matches!(result, Err(Error::CircuitOpen)));
        }
        assert_eq!(
            mock_calls.load(std::sync::atomic::Ordering::SeqCst),
            3,
            "calls while the circuit is open must never reach the mock"
        );
    }

    #[tokio::test]
    async fn closed_state_decrements_failures_on_success() {
        let breaker = CircuitBreaker::new(config(5, Duration::from_secs(60)));
        let _: Result<(), Error> = breaker
            .call(|| async { Err(Error::transport(ErrorKind::Network, "timeout")) })
            .await;
        let _: Result<(), Error> = breaker
            .call(|| async { Err(Error::transport(ErrorKind::Network, "timeout")) })
            .await;
        assert_eq!(breaker.get_state().failures, 2);

        let _: Result<(), Error> = breaker.call(|| async { Ok(()) }).await;
        assert_eq!(breaker.get_state().failures, 1);
    }

    #[tokio::test]
    async fn records_per_kind_counts_and_recent_errors() {
        let breaker = CircuitBreaker::new(config(10, Duration::from_secs(60)));
        let _: Result<(), Error> = breaker
            .call(|| async { Err(Error::transport(ErrorKind::Quota, "rate limit exceeded")) })
            .await;

        let snapshot = breaker.get_state();
        assert_eq!(snapshot.kind_counts.get(ErrorKind::Quota), 1);
        assert_eq!(snapshot.recent_errors.len(), 1);
    }
}
