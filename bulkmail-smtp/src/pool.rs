//! A breaker-guarded pool of SMTP sessions, with its own internal breaker
//! tripping after N consecutive failures — distinct from the dispatch
//! engine's per-send breaker in `bulkmail-dispatch`.

use std::collections::VecDeque;
use std::time::Duration;

use bulkmail_common::config::SmtpConfig;
use bulkmail_common::error::Error;
use bulkmail_resilience::{CircuitBreaker, CircuitBreakerConfig};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::session::Session;

/// Pool tuning.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub initial_size: usize,
    pub max_size: usize,
    pub max_idle_time: Duration,
    pub max_wait_time: Duration,
    pub health_check_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_size: 5,
            max_size: 20,
            max_idle_time: Duration::from_secs(5 * 60),
            max_wait_time: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(30),
        }
    }
}

const INTERNAL_BREAKER_MAX_FAILURES: u32 = 3;
const HEALTH_CHECK_SAMPLE: usize = 5;

struct Inner {
    idle: VecDeque<Session>,
    total: usize,
    closed: bool,
}

/// A pool of SMTP sessions to a single configured server.
pub struct SessionPool {
    smtp_config: SmtpConfig,
    pool_config: PoolConfig,
    breaker: CircuitBreaker,
    inner: Mutex<Inner>,
    /// Bounds concurrent outstanding sessions at `max_size`.
    permits: Semaphore,
}

impl SessionPool {
    #[must_use]
    pub fn new(smtp_config: SmtpConfig, pool_config: PoolConfig) -> Self {
        let max_size = pool_config.max_size;
        Self {
            smtp_config,
            pool_config,
            breaker: CircuitBreaker::new(CircuitBreakerConfig {
                max_failures: INTERNAL_BREAKER_MAX_FAILURES,
                timeout: Duration::from_secs(30),
            }),
            inner: Mutex::new(Inner {
                idle: VecDeque::new(),
                total: 0,
                closed: false,
            }),
            permits: Semaphore::new(max_size),
        }
    }

    /// Acquires a session, creating one if necessary.
    ///
    /// # Errors
    /// - `Error::CircuitOpen` if the internal breaker has tripped.
    /// - `Error::PoolExhausted` if no session becomes available within
    ///   `max_wait_time` and the pool is already at `max_size`.
    pub async fn get(&self) -> Result<Session, Error> {
        loop {
            if let Some(mut session) = self.pop_fresh_idle() {
                session.touch();
                return Ok(session);
            }

            let Ok(permit) = self.permits.try_acquire() else {
                // At capacity: wait up to max_wait_time for a session to be
                // returned, then give up with PoolExhausted.
                return self.wait_for_release().await;
            };
            permit.forget();

            match self
                .breaker
                .call(|| async { Session::connect(&self.smtp_config).await })
                .await
            {
                Ok(session) => {
                    let mut inner = self.inner.lock();
                    inner.total += 1;
                    return Ok(session);
                }
                Err(err) => {
                    self.permits.add_permits(1);
                    return Err(err);
                }
            }
        }
    }

    fn pop_fresh_idle(&self) -> Option<Session> {
        let mut inner = self.inner.lock();
        while let Some(session) = inner.idle.pop_front() {
            if session.idle_age() > self.pool_config.max_idle_time {
                inner.total -= 1;
                continue;
            }
            return Some(session);
        }
        None
    }

    async fn wait_for_release(&self) -> Result<Session, Error> {
        let wait = timeout(self.pool_config.max_wait_time, async {
            loop {
                if let Some(session) = self.pop_fresh_idle() {
                    return session;
                }
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
        });

        wait.await.map_err(|_| Error::PoolExhausted)
    }

    /// Returns a session to the pool, or closes it if the pool is closed or full.
    pub async fn put(&self, session: Session) {
        let should_close = {
            let mut inner = self.inner.lock();
            if inner.closed || inner.idle.len() >= self.pool_config.max_size {
                inner.total = inner.total.saturating_sub(1);
                true
            } else {
                inner.idle.push_back(session_with_touch(session));
                false
            }
        };

        if should_close {
            self.permits.add_permits(1);
        }
    }

    /// Runs one health-check tick: samples up to 5 idle sessions, closing
    /// unhealthy ones and replenishing up to `max_size`.
    pub async fn health_check_tick(&self) {
        let mut sampled = Vec::new();
        {
            let mut inner = self.inner.lock();
            for _ in 0..HEALTH_CHECK_SAMPLE.min(inner.idle.len()) {
                if let Some(session) = inner.idle.pop_front() {
                    sampled.push(session);
                }
            }
        }

        let mut healthy = Vec::new();
        let mut closed_count = 0;
        for mut session in sampled {
            if session.idle_age() > self.pool_config.max_idle_time {
                closed_count += 1;
                session.close().await;
                continue;
            }
            match session.noop().await {
                Ok(()) => healthy.push(session),
                Err(_) => {
                    closed_count += 1;
                    session.close().await;
                }
            }
        }

        {
            let mut inner = self.inner.lock();
            inner.total = inner.total.saturating_sub(closed_count);
            for session in healthy {
                inner.idle.push_back(session);
            }
        }
        self.permits.add_permits(closed_count);

        tracing::debug!(closed_count, "SMTP pool health check tick complete");
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
    }

    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

fn session_with_touch(mut session: Session) -> Session {
    session.touch();
    session
}

#[cfg(test)]
mod tests {
    use super::*;

    fn smtp_config() -> SmtpConfig {
        SmtpConfig {
            host: "localhost".into(),
            port: Some(1),
            username: String::new(),
            password: String::new(),
            from: "sender@example.com".into(),
            use_tls: false,
            insecure_skip_verify: false,
            connection_timeout_secs: 1,
            read_timeout_secs: 1,
            write_timeout_secs: 1,
        }
    }

    #[tokio::test]
    async fn pool_exhausted_when_max_size_and_no_idle_sessions() {
        let pool = SessionPool::new(
            smtp_config(),
            PoolConfig {
                max_size: 0,
                max_wait_time: Duration::from_millis(20),
                ..PoolConfig::default()
            },
        );

        let result = pool.get().await;
        assert!(matches!(result, Err(Error::PoolExhausted)));
    }

    #[tokio::test]
    async fn unreachable_host_trips_internal_breaker_after_three_failures() {
        let pool = SessionPool::new(
            SmtpConfig {
                host: "127.0.0.1".into(),
                port: Some(1),
                ..smtp_config()
            },
            PoolConfig {
                max_size: 10,
                ..PoolConfig::default()
            },
        );

        for _ in 0..3 {
            let _ = pool.get().await;
        }

        let result = pool.get().await;
        assert!(matches!(result, Err(Error::CircuitOpen)));
    }
}
