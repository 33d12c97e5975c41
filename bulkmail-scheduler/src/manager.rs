//! Lazy job-store-and-scheduler construction plus an idle auto-shutdown
//! timer, built on `bulkmail_common::signal`'s broadcast shutdown plumbing.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bulkmail_common::error::Result;
use bulkmail_common::Signal;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::job::{Job, JobStatus};
use crate::scheduler::{JobHandler, Scheduler};
use crate::store::SchedulerStore;

/// Auto-shutdown configuration: after `shutdown_delay` of zero
/// pending-and-future jobs, the manager's daemon loop returns.
#[derive(Debug, Clone, Copy)]
pub struct AutoShutdown {
    pub shutdown_delay: Duration,
}

struct Lazy {
    store_path: PathBuf,
    resilience: Option<Arc<bulkmail_resilience::ResilienceManager>>,
    scheduler: Option<Arc<Scheduler>>,
}

/// Thin lifecycle wrapper around the job store and scheduler.
pub struct SchedulerManager {
    inner: Mutex<Lazy>,
    auto_shutdown: Option<AutoShutdown>,
    signal_tx: broadcast::Sender<Signal>,
}

impl SchedulerManager {
    #[must_use]
    pub fn new(
        store_path: impl Into<PathBuf>,
        resilience: Option<Arc<bulkmail_resilience::ResilienceManager>>,
        auto_shutdown: Option<AutoShutdown>,
    ) -> Self {
        let (signal_tx, _) = bulkmail_common::signal::channel();
        Self {
            inner: Mutex::new(Lazy {
                store_path: store_path.into(),
                resilience,
                scheduler: None,
            }),
            auto_shutdown,
            signal_tx,
        }
    }

    /// Lazily constructs the store and scheduler on first call, returning
    /// the shared scheduler handle on every call thereafter.
    ///
    /// # Errors
    /// Returns `Error::Io` if the backing store cannot be opened.
    pub fn scheduler(&self) -> Result<Arc<Scheduler>> {
        let mut lazy = self.inner.lock();
        if let Some(scheduler) = &lazy.scheduler {
            return Ok(Arc::clone(scheduler));
        }

        let store = Arc::new(SchedulerStore::open(&lazy.store_path)?);
        let scheduler = Arc::new(Scheduler::new(store, lazy.resilience.clone())?);
        lazy.scheduler = Some(Arc::clone(&scheduler));
        Ok(scheduler)
    }

    /// Schedules `job` against the lazily-constructed C9, arming it with
    /// `handler`.
    ///
    /// # Errors
    /// Returns `Error::Io` on construction or persistence failure.
    pub fn add_job(&self, job: Job, handler: Arc<dyn JobHandler>) -> Result<()> {
        self.scheduler()?.add_job(job, handler)
    }

    #[must_use]
    pub fn signal_sender(&self) -> broadcast::Sender<Signal> {
        self.signal_tx.clone()
    }

    /// Runs C9's poll loop plus, if `auto_shutdown` is configured, an idle
    /// monitor that fires `Signal::Shutdown` once no job is pending or
    /// scheduled for the future for `shutdown_delay`. Blocks until a
    /// shutdown signal is observed (daemon mode).
    ///
    /// # Errors
    /// Returns `Error::Io` if the scheduler cannot be constructed.
    pub async fn run_daemon(self: Arc<Self>) -> Result<()> {
        let scheduler = self.scheduler()?;
        let scheduler_handle: JoinHandle<()> = tokio::spawn({
            let scheduler = Arc::clone(&scheduler);
            let shutdown_rx = self.signal_tx.subscribe();
            async move { scheduler.serve(shutdown_rx).await }
        });

        if let Some(auto_shutdown) = self.auto_shutdown {
            self.run_idle_watch(Arc::clone(&scheduler), auto_shutdown).await;
        } else {
            let mut shutdown_rx = self.signal_tx.subscribe();
            let _ = shutdown_rx.recv().await;
        }

        let _ = scheduler_handle.await;
        Ok(())
    }

    async fn run_idle_watch(&self, scheduler: Arc<Scheduler>, auto_shutdown: AutoShutdown) {
        let mut shutdown_rx = self.signal_tx.subscribe();
        let mut idle_since: Option<tokio::time::Instant> = None;

        loop {
            let poll = tokio::time::sleep(Duration::from_secs(1));
            tokio::select! {
                biased;
                _ = shutdown_rx.recv() => return,
                () = poll => {
                    let has_future_work = scheduler
                        .list_jobs()
                        .iter()
                        .any(|j| matches!(j.status, JobStatus::Pending | JobStatus::Running));

                    if has_future_work {
                        idle_since = None;
                        continue;
                    }

                    let since = *idle_since.get_or_insert_with(tokio::time::Instant::now);
                    if since.elapsed() >= auto_shutdown.shutdown_delay {
                        let _ = self.signal_tx.send(Signal::Shutdown);
                        return;
                    }
                }
            }
        }
    }
}
