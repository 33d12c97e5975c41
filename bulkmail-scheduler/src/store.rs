//! A `sled`-backed keyed record store with a `jobs` tree and a `locks`
//! tree, read/written inside `sled` transactions. Leases need real
//! atomicity, which is why this store reaches for an embedded transactional
//! KV store rather than a plain in-memory or file-backed one.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bulkmail_common::error::{Error, Result};
use sled::transaction::{ConflictableTransactionError, TransactionError};

use crate::job::Job;

const LOCK_EXPIRY: Duration = Duration::from_secs(5 * 60);

/// A parsed lock value: `"<instance-id>:<acquired-at-nanos>"`.
struct Lease {
    instance_id: String,
    acquired_at_nanos: u128,
}

impl Lease {
    fn parse(raw: &[u8]) -> Option<Self> {
        let text = std::str::from_utf8(raw).ok()?;
        let (instance_id, nanos) = text.rsplit_once(':')?;
        let acquired_at_nanos = nanos.parse().ok()?;
        Some(Self {
            instance_id: instance_id.to_string(),
            acquired_at_nanos,
        })
    }

    fn is_expired(&self, now_nanos: u128) -> bool {
        now_nanos.saturating_sub(self.acquired_at_nanos) > LOCK_EXPIRY.as_nanos()
    }

    fn encode(instance_id: &str, now_nanos: u128) -> Vec<u8> {
        format!("{instance_id}:{now_nanos}").into_bytes()
    }
}

fn now_nanos() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos()
}

/// The job and lease persistence layer.
pub struct SchedulerStore {
    jobs: sled::Tree,
    locks: sled::Tree,
}

impl SchedulerStore {
    /// Opens (or creates) a `sled` database at `path` with `jobs` and
    /// `locks` trees.
    ///
    /// # Errors
    /// Returns `Error::Io` if the database cannot be opened.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let db = sled::open(path).map_err(sled_to_io)?;
        let jobs = db.open_tree("jobs").map_err(sled_to_io)?;
        let locks = db.open_tree("locks").map_err(sled_to_io)?;
        Ok(Self { jobs, locks })
    }

    /// In-memory store for tests: a temporary `sled` database.
    ///
    /// # Errors
    /// Returns `Error::Io` if the temporary database cannot be created.
    pub fn open_temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open().map_err(sled_to_io)?;
        let jobs = db.open_tree("jobs").map_err(sled_to_io)?;
        let locks = db.open_tree("locks").map_err(sled_to_io)?;
        Ok(Self { jobs, locks })
    }

    /// Upserts `job`.
    ///
    /// # Errors
    /// Returns `Error::Io` on a backing-store failure.
    pub fn save_job(&self, job: &Job) -> Result<()> {
        let bytes = serde_json::to_vec(job).map_err(|e| Error::Internal(e.to_string()))?;
        self.jobs.insert(job.id.as_bytes(), bytes).map_err(sled_to_io)?;
        self.jobs.flush().map_err(sled_to_io)?;
        Ok(())
    }

    /// # Errors
    /// Returns `Error::JobNotFound` if `id` has no record, or `Error::Io`
    /// on a backing-store failure.
    pub fn get_job(&self, id: &str) -> Result<Job> {
        let bytes = self
            .jobs
            .get(id.as_bytes())
            .map_err(sled_to_io)?
            .ok_or_else(|| Error::JobNotFound(id.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| Error::Internal(e.to_string()))
    }

    /// Full scan of every persisted job.
    ///
    /// # Errors
    /// Returns `Error::Io` on a backing-store failure.
    pub fn load_jobs(&self) -> Result<Vec<Job>> {
        self.jobs
            .iter()
            .values()
            .map(|v| {
                let bytes = v.map_err(sled_to_io)?;
                serde_json::from_slice(&bytes).map_err(|e| Error::Internal(e.to_string()))
            })
            .collect()
    }

    /// Attempts to acquire the lease for `job_id` on behalf of
    /// `instance_id`. Returns `true` (and writes a fresh lease) when the
    /// slot is absent, held by `instance_id` already, stale past 5 minutes,
    /// or unparseable; returns `false` without writing otherwise.
    ///
    /// # Errors
    /// Returns `Error::Io` on a backing-store failure.
    pub fn acquire_lock(&self, job_id: &str, instance_id: &str) -> Result<bool> {
        let now = now_nanos();
        let instance_id = instance_id.to_string();
        let job_id_bytes = job_id.as_bytes().to_vec();

        let acquired = self
            .locks
            .transaction(|tx| {
                let current = tx.get(&job_id_bytes)?;
                let should_acquire = match current.as_deref().and_then(Lease::parse) {
                    None => true,
                    Some(lease) => lease.instance_id == instance_id || lease.is_expired(now),
                };

                if should_acquire {
                    tx.insert(job_id_bytes.as_slice(), Lease::encode(&instance_id, now))?;
                }
                Ok::<bool, ConflictableTransactionError<Error>>(should_acquire)
            })
            .map_err(transaction_to_io)?;

        Ok(acquired)
    }

    /// Deletes the lease for `job_id` if it is owned by `instance_id` (or
    /// is unparseable).
    ///
    /// # Errors
    /// Returns `Error::Io` on a backing-store failure.
    pub fn release_lock(&self, job_id: &str, instance_id: &str) -> Result<()> {
        let instance_id = instance_id.to_string();
        let job_id_bytes = job_id.as_bytes().to_vec();

        self.locks
            .transaction(|tx| {
                let current = tx.get(&job_id_bytes)?;
                let owned_or_malformed = match current.as_deref().and_then(Lease::parse) {
                    None => current.is_some(),
                    Some(lease) => lease.instance_id == instance_id,
                };
                if owned_or_malformed {
                    tx.remove(job_id_bytes.as_slice())?;
                }
                Ok::<(), ConflictableTransactionError<Error>>(())
            })
            .map_err(transaction_to_io)?;

        Ok(())
    }

    /// Deletes every lease older than 5 minutes, plus every unparseable
    /// lease.
    ///
    /// # Errors
    /// Returns `Error::Io` on a backing-store failure.
    pub fn cleanup_expired_locks(&self) -> Result<usize> {
        let now = now_nanos();
        let mut removed = 0usize;
        for entry in self.locks.iter() {
            let (key, value) = entry.map_err(sled_to_io)?;
            let stale = match Lease::parse(&value) {
                Some(lease) => lease.is_expired(now),
                None => true,
            };
            if stale {
                self.locks.remove(key).map_err(sled_to_io)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn sled_to_io(e: sled::Error) -> Error {
    Error::Io(std::io::Error::other(e))
}

fn transaction_to_io(e: TransactionError<Error>) -> Error {
    match e {
        TransactionError::Abort(inner) => inner,
        TransactionError::Storage(e) => sled_to_io(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Job;
    use std::time::Duration as StdDuration;

    #[test]
    fn save_and_get_round_trips_a_job() {
        let store = SchedulerStore::open_temporary().unwrap();
        let job = Job::new(vec![1, 2, 3], 3, StdDuration::from_secs(1));
        store.save_job(&job).unwrap();

        let loaded = store.get_job(&job.id).unwrap();
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.payload, job.payload);
    }

    #[test]
    fn get_job_reports_not_found() {
        let store = SchedulerStore::open_temporary().unwrap();
        assert!(matches!(store.get_job("missing"), Err(Error::JobNotFound(_))));
    }

    #[test]
    fn acquire_lock_succeeds_once_then_blocks_a_different_instance() {
        let store = SchedulerStore::open_temporary().unwrap();
        assert!(store.acquire_lock("job-1", "instance-a").unwrap());
        assert!(!store.acquire_lock("job-1", "instance-b").unwrap());
    }

    #[test]
    fn acquire_lock_is_reentrant_for_the_same_instance() {
        let store = SchedulerStore::open_temporary().unwrap();
        assert!(store.acquire_lock("job-1", "instance-a").unwrap());
        assert!(store.acquire_lock("job-1", "instance-a").unwrap());
    }

    #[test]
    fn release_lock_only_removes_when_owned() {
        let store = SchedulerStore::open_temporary().unwrap();
        store.acquire_lock("job-1", "instance-a").unwrap();

        store.release_lock("job-1", "instance-b").unwrap();
        assert!(!store.acquire_lock("job-1", "instance-b").unwrap());

        store.release_lock("job-1", "instance-a").unwrap();
        assert!(store.acquire_lock("job-1", "instance-b").unwrap());
    }

    #[test]
    fn cleanup_expired_locks_removes_malformed_entries() {
        let store = SchedulerStore::open_temporary().unwrap();
        store.locks.insert("broken", b"not-a-lease").unwrap();
        let removed = store.cleanup_expired_locks().unwrap();
        assert_eq!(removed, 1);
    }

    #[test]
    fn load_jobs_returns_every_saved_job() {
        let store = SchedulerStore::open_temporary().unwrap();
        for _ in 0..3 {
            store.save_job(&Job::new(vec![], 1, StdDuration::from_secs(1))).unwrap();
        }
        assert_eq!(store.load_jobs().unwrap().len(), 3);
    }

    #[test]
    fn a_lease_just_under_the_expiry_window_still_blocks_other_instances() {
        let store = SchedulerStore::open_temporary().unwrap();
        let acquired_at = now_nanos() - StdDuration::from_secs(4 * 60).as_nanos();
        store.locks.insert("job-1", Lease::encode("instance-a", acquired_at)).unwrap();

        assert!(!store.acquire_lock("job-1", "instance-b").unwrap());
    }

    #[test]
    fn a_lease_past_the_expiry_window_is_acquirable_by_another_instance() {
        let store = SchedulerStore::open_temporary().unwrap();
        let acquired_at = now_nanos() - StdDuration::from_secs(5 * 60 + 1).as_nanos();
        store.locks.insert("job-1", Lease::encode("instance-a", acquired_at)).unwrap();

        assert!(store.acquire_lock("job-1", "instance-b").unwrap());
    }
}
