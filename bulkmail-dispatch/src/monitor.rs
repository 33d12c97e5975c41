//! Single-writer campaign progress tracker with a bounded log buffer and
//! best-effort broadcast to subscribers, built on `dashmap`'s concurrent-map
//! idiom for per-domain state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bulkmail_common::domain::Domain;
use bulkmail_common::email::Email;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as DashEntry;
use parking_lot::Mutex;
use tokio::sync::mpsc;

const LOG_BUFFER_CAPACITY: usize = 1000;
const SUBSCRIBER_CHANNEL_CAPACITY: usize = 256;

/// Recipient-level lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecipientState {
    Pending,
    Sending,
    Sent,
    Retry,
    Failed,
}

impl RecipientState {
    const fn index(self) -> usize {
        match self {
            Self::Pending => 0,
            Self::Sending => 1,
            Self::Sent => 2,
            Self::Retry => 3,
            Self::Failed => 4,
        }
    }
}

/// A single recipient-status change, broadcast to subscribers.
#[derive(Debug, Clone)]
pub struct RecipientUpdate {
    pub email: Email,
    pub state: RecipientState,
    pub duration: Duration,
    pub smtp_code: String,
}

/// A log line appended through `AddLogEntry`.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub message: String,
}

struct RecipientRecord {
    state: RecipientState,
    domain_counted: bool,
}

struct Inner {
    recipients: DashMap<Email, RecipientRecord>,
    counters: [AtomicU64; 5],
    domain_counts: DashMap<Domain, u64>,
    log: Mutex<VecDeque<LogEntry>>,
}

/// The standard, single-writer monitor implementation.
pub struct Monitor {
    inner: Inner,
    subscribers: Mutex<Vec<mpsc::Sender<RecipientUpdate>>>,
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Inner {
                recipients: DashMap::new(),
                counters: Default::default(),
                domain_counts: DashMap::new(),
                log: Mutex::new(VecDeque::with_capacity(LOG_BUFFER_CAPACITY)),
            },
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Marks every recipient in `recipients` as `Pending`, counting each
    /// domain exactly once per recipient on first observation.
    pub fn initialize_campaign(&self, recipients: &[Email]) {
        for email in recipients {
            self.observe_new_recipient(email);
        }
    }

    fn observe_new_recipient(&self, email: &Email) {
        if self.inner.recipients.contains_key(email) {
            return;
        }
        self.inner.recipients.insert(
            email.clone(),
            RecipientRecord {
                state: RecipientState::Pending,
                domain_counted: true,
            },
        );
        *self.inner.domain_counts.entry(email.domain()).or_insert(0) += 1;
        self.bump_counter(RecipientState::Pending, 1);
    }

    /// Transitions `email`'s state, decrementing the old counter (if any —
    /// a never-before-seen recipient has none) and incrementing the new
    /// one. A recipient's domain is counted exactly once: on first
    /// observation, or on first transition out of `Pending`, whichever
    /// happens first.
    pub fn update_recipient_status(
        &self,
        email: &Email,
        state: RecipientState,
        duration: Duration,
        smtp_code: &str,
    ) {
        let old_state = match self.inner.recipients.entry(email.clone()) {
            DashEntry::Occupied(mut occupied) => {
                let old = occupied.get().state;
                occupied.get_mut().state = state;
                Some(old)
            }
            DashEntry::Vacant(vacant) => {
                vacant.insert(RecipientRecord {
                    state,
                    domain_counted: false,
                });
                None
            }
        };

        match old_state {
            Some(old) if old != state => {
                self.bump_counter(old, -1);
                self.bump_counter(state, 1);
            }
            Some(_) => {}
            None => self.bump_counter(state, 1),
        }

        let needs_domain_count = self
            .inner
            .recipients
            .get_mut(email)
            .map(|mut record| {
                if record.domain_counted {
                    false
                } else {
                    record.domain_counted = true;
                    true
                }
            })
            .unwrap_or(false);

        if needs_domain_count {
            *self.inner.domain_counts.entry(email.domain()).or_insert(0) += 1;
        }

        self.broadcast(RecipientUpdate {
            email: email.clone(),
            state,
            duration,
            smtp_code: smtp_code.to_string(),
        });
    }

    fn bump_counter(&self, state: RecipientState, delta: i64) {
        let counter = &self.inner.counters[state.index()];
        if delta >= 0 {
            counter.fetch_add(delta as u64, Ordering::Relaxed);
        } else {
            counter.fetch_sub((-delta) as u64, Ordering::Relaxed);
        }
    }

    /// Records the 3-digit (or `"error"`) SMTP response code for `email`.
    pub fn add_smtp_response(&self, email: &Email, code: &str) {
        self.append_log(format!("{email}: SMTP response {code}"));
    }

    /// Appends a free-form log line, bounded FIFO to `LOG_BUFFER_CAPACITY`.
    pub fn add_log_entry(&self, message: impl Into<String>) {
        self.append_log(message.into());
    }

    fn append_log(&self, message: String) {
        let mut log = self.inner.log.lock();
        if log.len() >= LOG_BUFFER_CAPACITY {
            log.pop_front();
        }
        log.push_back(LogEntry { message });
    }

    /// Subscribes to recipient-status updates. The subscriber is removed
    /// (and implicitly closed) the next time a broadcast finds its inbound
    /// channel full or already closed.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::Receiver<RecipientUpdate> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CHANNEL_CAPACITY);
        self.subscribers.lock().push(tx);
        rx
    }

    fn broadcast(&self, update: RecipientUpdate) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.try_send(update.clone()).is_ok());
    }

    #[must_use]
    pub fn counters(&self) -> [u64; 5] {
        std::array::from_fn(|i| self.inner.counters[i].load(Ordering::Relaxed))
    }

    #[must_use]
    pub fn domain_count(&self, domain: &Domain) -> u64 {
        self.inner.domain_counts.get(domain).map_or(0, |v| *v)
    }

    #[must_use]
    pub fn log_entries(&self) -> Vec<String> {
        self.inner.log.lock().iter().map(|e| e.message.clone()).collect()
    }
}

/// A no-op monitor, wired in when no monitor is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMonitor;

impl NullMonitor {
    pub fn initialize_campaign(&self, _recipients: &[Email]) {}
    pub fn update_recipient_status(
        &self,
        _email: &Email,
        _state: RecipientState,
        _duration: Duration,
        _smtp_code: &str,
    ) {
    }
    pub fn add_smtp_response(&self, _email: &Email, _code: &str) {}
    pub fn add_log_entry(&self, _message: impl Into<String>) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_campaign_counts_pending_once_per_domain() {
        let monitor = Monitor::new();
        let recipients = vec![Email::from("a@example.com"), Email::from("b@example.com")];
        monitor.initialize_campaign(&recipients);

        assert_eq!(monitor.counters()[RecipientState::Pending.index()], 2);
        assert_eq!(monitor.domain_count(&Domain::new("example.com")), 2);
    }

    #[test]
    fn status_transition_moves_counts_between_buckets() {
        let monitor = Monitor::new();
        let email = Email::from("a@example.com");
        monitor.initialize_campaign(&[email.clone()]);

        monitor.update_recipient_status(&email, RecipientState::Sending, Duration::ZERO, "");
        assert_eq!(monitor.counters()[RecipientState::Pending.index()], 0);
        assert_eq!(monitor.counters()[RecipientState::Sending.index()], 1);

        monitor.update_recipient_status(&email, RecipientState::Sent, Duration::from_millis(5), "250");
        assert_eq!(monitor.counters()[RecipientState::Sending.index()], 0);
        assert_eq!(monitor.counters()[RecipientState::Sent.index()], 1);
    }

    #[test]
    fn re_observing_same_recipient_never_double_counts_domain() {
        let monitor = Monitor::new();
        let email = Email::from("a@example.com");
        monitor.initialize_campaign(&[email.clone()]);
        monitor.update_recipient_status(&email, RecipientState::Sent, Duration::ZERO, "250");
        monitor.update_recipient_status(&email, RecipientState::Sent, Duration::ZERO, "250");

        assert_eq!(monitor.domain_count(&Domain::new("example.com")), 1);
    }

    #[test]
    fn log_buffer_is_bounded_fifo() {
        let monitor = Monitor::new();
        for i in 0..(LOG_BUFFER_CAPACITY + 10) {
            monitor.add_log_entry(format!("entry {i}"));
        }

        let entries = monitor.log_entries();
        assert_eq!(entries.len(), LOG_BUFFER_CAPACITY);
        assert_eq!(entries[0], "entry 10");
    }

    #[tokio::test]
    async fn full_subscriber_channel_is_removed_on_next_broadcast() {
        let monitor = Monitor::new();
        let rx = monitor.subscribe();

        let email = Email::from("a@example.com");
        // Never drain `rx`: once its bounded channel fills, the subscriber
        // must be dropped from the list rather than blocking the writer.
        for _ in 0..(SUBSCRIBER_CHANNEL_CAPACITY + 5) {
            monitor.update_recipient_status(&email, RecipientState::Sending, Duration::ZERO, "");
        }

        assert_eq!(monitor.subscribers.lock().len(), 0);
        drop(rx);
    }
}
