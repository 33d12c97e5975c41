//! At-most-once durable recording of delivered addresses, append-only with
//! fsync, tolerant of partial lines left by a mid-write crash.

use std::path::{Path, PathBuf};

use ahash::AHashSet;
use bulkmail_common::email::Email;
use bulkmail_common::error::Error;
use parking_lot::Mutex;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

const DEFAULT_BUFFER_THRESHOLD: usize = 10;

struct State {
    sent: AHashSet<Email>,
    pending: Vec<Email>,
}

/// Durable at-most-once delivery log.
pub struct OffsetTracker {
    file_path: PathBuf,
    buffer_threshold: usize,
    state: Mutex<State>,
}

impl OffsetTracker {
    #[must_use]
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
            buffer_threshold: DEFAULT_BUFFER_THRESHOLD,
            state: Mutex::new(State {
                sent: AHashSet::new(),
                pending: Vec::new(),
            }),
        }
    }

    #[must_use]
    pub fn with_buffer_threshold(mut self, threshold: usize) -> Self {
        self.buffer_threshold = threshold.max(1);
        self
    }

    /// Parses the backing file line by line. A missing file is an empty
    /// set, not an error. Blank lines are ignored. Two shapes are accepted:
    /// the canonical `<email>` form and the legacy `<jobID>:<offset>` form
    /// (from which only the numeric offset is meaningful, retained here as
    /// a synthetic marker so repeated loads stay idempotent).
    ///
    /// # Errors
    /// Returns an `Error::Io` only for failures other than "file not found".
    pub async fn load(&self) -> Result<(), Error> {
        let contents = match tokio::fs::read_to_string(&self.file_path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Error::Io(e)),
        };

        let mut sent = AHashSet::new();
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }

            if let Some((job_id, offset)) = line.split_once(':') {
                if offset.trim().parse::<u64>().is_ok() {
                    sent.insert(Email::from(format!("legacy-offset:{job_id}:{offset}")));
                    continue;
                }
            }

            sent.insert(Email::from(line.to_string()));
        }

        let mut state = self.state.lock();
        state.sent = sent;
        state.pending.clear();
        Ok(())
    }

    /// No-op if `email` was already recorded; otherwise records it and
    /// flushes once `pending` reaches `buffer_threshold`.
    ///
    /// # Errors
    /// Propagates any I/O error from an implicit flush.
    pub async fn mark_sent(&self, email: &Email) -> Result<(), Error> {
        let should_flush = {
            let mut state = self.state.lock();
            if state.sent.contains(email) {
                return Ok(());
            }
            state.sent.insert(email.clone());
            state.pending.push(email.clone());
            state.pending.len() >= self.buffer_threshold
        };

        if should_flush {
            self.flush().await?;
        }
        Ok(())
    }

    /// Appends all pending emails to the file (`O_APPEND|O_CREATE|O_WRONLY`),
    /// fsyncs, and truncates the in-memory buffer on success.
    ///
    /// # Errors
    /// Returns `Error::Io` if the open, write, or fsync fails. Pending
    /// entries are retained (not lost) on failure, to be retried on the
    /// next `mark_sent` or an explicit `flush`.
    pub async fn flush(&self) -> Result<(), Error> {
        let pending = {
            let state = self.state.lock();
            state.pending.clone()
        };

        if pending.is_empty() {
            return Ok(());
        }

        let mut payload = String::new();
        for email in &pending {
            payload.push_str(email.as_str());
            payload.push('\n');
        }

        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.file_path)
            .await?;
        file.write_all(payload.as_bytes()).await?;
        file.sync_all().await?;

        let mut state = self.state.lock();
        state.pending.clear();
        Ok(())
    }

    /// Empties memory state and unlinks the backing file.
    ///
    /// # Errors
    /// Returns `Error::Io` if the file exists but cannot be removed.
    pub async fn reset(&self) -> Result<(), Error> {
        {
            let mut state = self.state.lock();
            state.sent.clear();
            state.pending.clear();
        }

        match tokio::fs::remove_file(&self.file_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Rewrites the entire backing file atomically from in-memory state via
    /// a temp-file-then-rename, used only for full snapshots, not the
    /// incremental append path.
    ///
    /// # Errors
    /// Returns `Error::Io` if the temp file cannot be written or renamed.
    pub async fn snapshot(&self) -> Result<(), Error> {
        let emails: Vec<Email> = {
            let state = self.state.lock();
            state.sent.iter().cloned().collect()
        };

        let mut payload = String::new();
        for email in &emails {
            payload.push_str(email.as_str());
            payload.push('\n');
        }

        let tmp_path = temp_path_for(&self.file_path);
        tokio::fs::write(&tmp_path, payload.as_bytes()).await?;
        tokio::fs::rename(&tmp_path, &self.file_path).await?;
        Ok(())
    }

    #[must_use]
    pub fn is_sent(&self, email: &Email) -> bool {
        self.state.lock().sent.contains(email)
    }

    #[must_use]
    pub fn sent_count(&self) -> usize {
        self.state.lock().sent.len()
    }
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tracker_in(dir: &TempDir) -> OffsetTracker {
        OffsetTracker::new(dir.path().join("offsets.log")).with_buffer_threshold(3)
    }

    #[tokio::test]
    async fn load_on_missing_file_is_empty_not_an_error() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker_in(&dir);
        tracker.load().await.unwrap();
        assert_eq!(tracker.sent_count(), 0);
    }

    #[tokio::test]
    async fn mark_sent_is_idempotent_for_repeat_email() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker_in(&dir);
        let email = Email::from("a@example.com");

        tracker.mark_sent(&email).await.unwrap();
        tracker.mark_sent(&email).await.unwrap();

        assert_eq!(tracker.sent_count(), 1);
    }

    #[tokio::test]
    async fn flush_happens_automatically_at_buffer_threshold() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker_in(&dir);

        for i in 0..3 {
            tracker.mark_sent(&Email::from(format!("u{i}@example.com"))).await.unwrap();
        }

        let contents = tokio::fs::read_to_string(dir.path().join("offsets.log")).await.unwrap();
        assert_eq!(contents.lines().count(), 3);
    }

    #[tokio::test]
    async fn load_ignores_blank_lines_and_accepts_legacy_shape() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("offsets.log");
        tokio::fs::write(&path, "a@example.com\n\njob-123:42\nb@example.com\n")
            .await
            .unwrap();

        let tracker = OffsetTracker::new(&path);
        tracker.load().await.unwrap();

        assert!(tracker.is_sent(&Email::from("a@example.com")));
        assert!(tracker.is_sent(&Email::from("b@example.com")));
        assert_eq!(tracker.sent_count(), 3);
    }

    #[tokio::test]
    async fn reset_clears_memory_and_unlinks_file() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker_in(&dir);
        tracker.mark_sent(&Email::from("a@example.com")).await.unwrap();
        tracker.flush().await.unwrap();

        tracker.reset().await.unwrap();

        assert_eq!(tracker.sent_count(), 0);
        assert!(!dir.path().join("offsets.log").exists());
    }

    #[tokio::test]
    async fn snapshot_rewrites_file_atomically_via_rename() {
        let dir = TempDir::new().unwrap();
        let tracker = tracker_in(&dir);
        tracker.mark_sent(&Email::from("a@example.com")).await.unwrap();

        tracker.snapshot().await.unwrap();

        let contents = tokio::fs::read_to_string(dir.path().join("offsets.log")).await.unwrap();
        assert_eq!(contents.trim(), "a@example.com");
        assert!(!dir.path().join("offsets.log.tmp").exists());
    }
}
