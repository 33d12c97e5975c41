//! A ~200ms-period adaptive polling dispatcher that acquires leases from the
//! job store, executes jobs through the resilience manager, and reschedules
//! on completion. Built around a `tokio::select!` over an interval plus a
//! shutdown signal.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bulkmail_common::error::{Error, Result};
use chrono::Utc;
use cron::Schedule;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use tokio::sync::broadcast;

use crate::job::{parse_duration, Job, JobStatus};
use crate::store::SchedulerStore;

const BASE_POLL_INTERVAL: Duration = Duration::from_millis(200);
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(5 * 60);
const JITTER_CEILING_MS: u64 = 500;

/// A function from `Job` to a fallible outcome. The standard handler
/// decodes the payload as campaign arguments and drives a send (single
/// recipient or full campaign) through the dispatch engine; that decoding
/// is the binary crate's concern, not this scheduler's.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<()>;
}

fn instance_id() -> String {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let random: u64 = rand::rng().random();
    format!("{nanos}-{random}")
}

/// The polling dispatcher.
pub struct Scheduler {
    store: Arc<SchedulerStore>,
    handlers: Mutex<HashMap<String, Arc<dyn JobHandler>>>,
    cache: RwLock<Vec<Job>>,
    instance_id: String,
    resilience: Option<Arc<bulkmail_resilience::ResilienceManager>>,
}

impl Scheduler {
    /// # Errors
    /// Returns `Error::Io` if the initial warm-up scan of `store` fails.
    pub fn new(store: Arc<SchedulerStore>, resilience: Option<Arc<bulkmail_resilience::ResilienceManager>>) -> Result<Self> {
        let cache = store.load_jobs()?;
        Ok(Self {
            store,
            handlers: Mutex::new(HashMap::new()),
            cache: RwLock::new(cache),
            instance_id: instance_id(),
            resilience,
        })
    }

    /// Persists `job` and registers `handler` against its id.
    ///
    /// # Errors
    /// Returns `Error::Io` on a backing-store failure.
    pub fn add_job(&self, job: Job, handler: Arc<dyn JobHandler>) -> Result<()> {
        self.store.save_job(&job)?;
        self.handlers.lock().insert(job.id.clone(), handler);
        self.refresh_cache()?;
        Ok(())
    }

    /// Marks `id` cancelled; future dispatch rounds ignore it.
    ///
    /// # Errors
    /// Returns `Error::JobNotFound` or `Error::Io`.
    pub fn cancel_job(&self, id: &str) -> Result<()> {
        let mut job = self.store.get_job(id)?;
        job.status = JobStatus::Cancelled;
        job.updated_at = Utc::now();
        self.store.save_job(&job)?;
        self.refresh_cache()?;
        Ok(())
    }

    #[must_use]
    pub fn list_jobs(&self) -> Vec<Job> {
        self.cache.read().clone()
    }

    /// Binds `default_handler` to every persisted job without a registered
    /// handler, for process restart recovery.
    pub fn reattach_handlers(&self, default_handler: Arc<dyn JobHandler>) {
        let mut handlers = self.handlers.lock();
        for job in self.cache.read().iter() {
            handlers.entry(job.id.clone()).or_insert_with(|| Arc::clone(&default_handler));
        }
    }

    fn refresh_cache(&self) -> Result<()> {
        *self.cache.write() = self.store.load_jobs()?;
        Ok(())
    }

    /// Runs the poll loop until `shutdown` fires. Adaptive: the interval
    /// shortens toward `BASE_POLL_INTERVAL` after a tick with due jobs, and
    /// lengthens (capped at `MAX_POLL_INTERVAL`) after an idle tick.
    pub async fn serve(self: Arc<Self>, mut shutdown: broadcast::Receiver<bulkmail_common::Signal>) {
        let mut period = BASE_POLL_INTERVAL;
        loop {
            tokio::select! {
                biased;
                _ = shutdown.recv() => return,
                () = tokio::time::sleep(period) => {
                    let had_due_jobs = self.tick().await;
                    period = if had_due_jobs {
                        BASE_POLL_INTERVAL
                    } else {
                        (period * 2).min(MAX_POLL_INTERVAL)
                    };
                }
            }
        }
    }

    /// One dispatch round. Returns whether any due job was found.
    async fn tick(&self) -> bool {
        let jobs = match self.store.load_jobs() {
            Ok(jobs) => jobs,
            Err(e) => {
                tracing::error!(error = %e, "failed to load jobs for dispatch round");
                return false;
            }
        };

        let now = Utc::now();
        let due: Vec<Job> = jobs.into_iter().filter(|j| j.is_due(now)).collect();
        let had_due_jobs = !due.is_empty();

        for job in due {
            let acquired = match self.store.acquire_lock(&job.id, &self.instance_id) {
                Ok(acquired) => acquired,
                Err(e) => {
                    tracing::error!(error = %e, job_id = %job.id, "lease acquisition failed");
                    continue;
                }
            };
            if !acquired {
                continue;
            }

            let job_id = job.id.clone();
            let handler = self.handlers.lock().get(&job.id).cloned();
            self.execute(job, handler).await;

            if let Err(e) = self.store.release_lock(&job_id, &self.instance_id) {
                tracing::warn!(error = %e, "failed to release lease after execution");
            }
        }

        if let Err(e) = self.refresh_cache() {
            tracing::warn!(error = %e, "failed to refresh job cache after dispatch round");
        }

        had_due_jobs
    }

    /// Runs `job` to completion, updating its status and schedule.
    async fn execute(&self, mut job: Job, handler: Option<Arc<dyn JobHandler>>) {
        job.status = JobStatus::Running;
        let now = Utc::now();

        let Some(handler) = handler else {
            tracing::warn!(job_id = %job.id, "due job has no registered handler, skipping");
            return;
        };

        let outcome = match &self.resilience {
            Some(resilience) => {
                resilience
                    .execute(std::future::pending(), || {
                        let job = &job;
                        let handler = Arc::clone(&handler);
                        async move { handler.handle(job).await }
                    })
                    .await
            }
            None => handler.handle(&job).await,
        };

        match outcome {
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "job execution failed");
                job.attempts += 1;
                if job.attempts < job.max_attempts {
                    let exponent = job.attempts.saturating_sub(1);
                    let base = job.backoff_base.saturating_mul(2u32.saturating_pow(exponent));
                    let base = base.min(MAX_BACKOFF);
                    let jitter = Duration::from_millis(rand::rng().random_range(0..JITTER_CEILING_MS));
                    let delay = (base + jitter).min(MAX_BACKOFF);
                    job.status = JobStatus::Pending;
                    job.run_at = now + chrono::Duration::from_std(delay).unwrap_or_default();
                } else {
                    job.status = JobStatus::Failed;
                }
            }
            Ok(()) => {
                job.last_run_at = Some(now);
                if let Some(interval) = job.interval.as_deref().and_then(parse_duration) {
                    job.status = JobStatus::Pending;
                    job.run_at = now + chrono::Duration::from_std(interval).unwrap_or_default();
                } else if let Some(cron_expr) = job.cron_expr.clone().filter(|s| !s.is_empty()) {
                    // `cron` expects a leading seconds field; `Job` stores
                    // the standard 5-field form, so prefix a "0".
                    let six_field = format!("0 {cron_expr}");
                    match Schedule::from_str(&six_field) {
                        Ok(schedule) => match schedule.after(&now).next() {
                            Some(next) => {
                                job.status = JobStatus::Pending;
                                job.run_at = next;
                            }
                            None => job.status = JobStatus::Done,
                        },
                        Err(e) => {
                            tracing::error!(job_id = %job.id, error = %e, "invalid cron expression");
                            job.status = JobStatus::Failed;
                        }
                    }
                } else {
                    job.status = JobStatus::Done;
                }
            }
        }

        job.updated_at = Utc::now();
        if let Err(e) = self.store.save_job(&job) {
            tracing::error!(job_id = %job.id, error = %e, "failed to persist job after execution");
        }
    }
}
