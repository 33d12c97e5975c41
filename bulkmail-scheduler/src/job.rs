//! The persisted unit of scheduled work, plus the tiny duration-string
//! parser `interval` uses (`"200ms"`, `"5s"`, `"1h"`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A job's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
}

/// A persisted unit of scheduled work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub payload: Vec<u8>,
    pub status: JobStatus,
    pub run_at: DateTime<Utc>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub cron_expr: Option<String>,
    pub interval: Option<String>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Builds a fresh `Pending` job due immediately, with the given payload
    /// and retry ceiling. `cron_expr`/`interval` are left unset; set them
    /// via the builder methods before calling `SchedulerStore::save_job`.
    #[must_use]
    pub fn new(payload: Vec<u8>, max_attempts: u32, backoff_base: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: ulid::Ulid::new().to_string(),
            payload,
            status: JobStatus::Pending,
            run_at: now,
            next_run_at: None,
            last_run_at: None,
            cron_expr: None,
            interval: None,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            backoff_base,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub fn with_cron(mut self, expr: impl Into<String>) -> Self {
        self.cron_expr = Some(expr.into());
        self
    }

    #[must_use]
    pub fn with_interval(mut self, interval: impl Into<String>) -> Self {
        self.interval = Some(interval.into());
        self
    }

    #[must_use]
    pub fn with_run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = run_at;
        self
    }

    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.run_at <= now
    }
}

/// Parses a small duration-string grammar: an integer followed by one of
/// `ms`, `s`, `m`, `h`. Returns `None` for anything else, so callers can
/// fall back to treating `interval` as unset.
#[must_use]
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let split_at = raw.find(|c: char| !c.is_ascii_digit())?;
    let (digits, unit) = raw.split_at(split_at);
    let value: u64 = digits.parse().ok()?;

    match unit {
        "ms" => Some(Duration::from_millis(value)),
        "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 3600)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_recognizes_supported_units() {
        assert_eq!(parse_duration("200ms"), Some(Duration::from_millis(200)));
        assert_eq!(parse_duration("5s"), Some(Duration::from_secs(5)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("1h"), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn parse_duration_rejects_unknown_units_and_garbage() {
        assert_eq!(parse_duration("5 days"), None);
        assert_eq!(parse_duration("not-a-duration"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn is_due_requires_pending_and_elapsed_run_at() {
        let job = Job::new(vec![], 3, Duration::from_secs(1));
        assert!(job.is_due(Utc::now()));
        assert!(!job.is_due(job.run_at - chrono::Duration::seconds(1)));
    }
}
