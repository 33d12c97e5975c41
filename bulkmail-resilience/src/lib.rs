//! Resilience layer: error classification, circuit breaker, and retry
//! policy shared between outbound SMTP I/O and scheduled job execution.

pub mod breaker;
pub mod classifier;
pub mod manager;
pub mod retry;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use classifier::classify;
pub use manager::ResilienceManager;
pub use retry::RetryPolicy;
