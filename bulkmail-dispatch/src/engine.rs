//! Worker pool with per-worker owned SMTP sessions, batched sends, and an
//! async retry loop built around a task/retry channel pipeline.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine as _;
use bulkmail_common::config::SmtpConfig;
use bulkmail_common::error::Error;
use bulkmail_smtp::Session;
use rand::Rng;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};

use crate::monitor::{Monitor, RecipientState};
use crate::offset_tracker::OffsetTracker;
use crate::task::{Attachment, Task};

/// Tunables and collaborators for one dispatch run.
pub struct DispatchOptions {
    pub smtp: SmtpConfig,
    pub concurrency: usize,
    pub batch_size: usize,
    pub retry_limit: u32,
    pub max_backoff: Duration,
    pub monitor: Arc<Monitor>,
    pub offset_tracker: Option<Arc<OffsetTracker>>,
    pub start_offset: usize,
}

const SMTP_CODE_CANDIDATES: &[&str] = &[
    "421", "450", "451", "452", "550", "551", "552", "553", "554",
];

/// Extracts a 3-digit SMTP status code from an error's text: the fast path
/// takes a leading 3-digit run, falling back to a search over a fixed set of
/// codes meaningful for retry/permanent-failure decisions.
fn extract_smtp_code(message: &str) -> String {
    let trimmed = message.trim_start();
    if trimmed.len() >= 3 && trimmed.as_bytes()[..3].iter().all(u8::is_ascii_digit) {
        return trimmed[..3].to_string();
    }

    for candidate in SMTP_CODE_CANDIDATES {
        if message.contains(candidate) {
            return (*candidate).to_string();
        }
    }

    "error".to_string()
}

fn channel_capacity(numerator: usize, denominator: usize, floor: usize, ceiling: usize) -> usize {
    (numerator / denominator.max(1)).clamp(floor, ceiling)
}

/// Shared state workers and the retry router poll to decide when the run is
/// quiescent: every task has reached a terminal state (`Sent` or
/// permanently `Failed`) and no retry is still sleeping.
struct Completion {
    outstanding: AtomicUsize,
    done_tx: watch::Sender<bool>,
}

impl Completion {
    fn new(task_count: usize) -> (Arc<Self>, watch::Receiver<bool>) {
        let (done_tx, done_rx) = watch::channel(task_count == 0);
        (
            Arc::new(Self {
                outstanding: AtomicUsize::new(task_count),
                done_tx,
            }),
            done_rx,
        )
    }

    fn mark_terminal(&self) {
        if self.outstanding.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _ = self.done_tx.send(true);
        }
    }
}

/// Runs the dispatch engine to completion (or until `shutdown` fires),
/// returning once every task has been sent, permanently failed, or
/// abandoned due to shutdown.
pub async fn run(
    tasks: Vec<Task>,
    options: DispatchOptions,
    shutdown: tokio::sync::broadcast::Receiver<bulkmail_common::Signal>,
) {
    if tasks.is_empty() {
        return;
    }

    let task_count = tasks.len();
    let task_capacity = channel_capacity(task_count, 2, options.concurrency.max(1), 2000);
    let retry_capacity = channel_capacity(task_count, 10, options.concurrency.max(1), 1000);

    options
        .monitor
        .initialize_campaign(&tasks.iter().map(|t| t.recipient.clone()).collect::<Vec<_>>());

    let (completion, done_rx) = Completion::new(task_count);
    let (task_tx, task_rx) = mpsc::channel::<Task>(task_capacity.max(1));
    let (retry_tx, mut retry_rx) = mpsc::channel::<Task>(retry_capacity.max(1));
    let task_rx = Arc::new(AsyncMutex::new(task_rx));
    let options = Arc::new(options);

    let mut worker_handles = Vec::with_capacity(options.concurrency);
    for _ in 0..options.concurrency {
        let task_rx = Arc::clone(&task_rx);
        let options = Arc::clone(&options);
        let completion = Arc::clone(&completion);
        let retry_tx = retry_tx.clone();
        let mut done_rx = done_rx.clone();
        let mut worker_shutdown = shutdown.resubscribe();
        worker_handles.push(tokio::spawn(async move {
            run_worker(task_rx, retry_tx, options, completion, &mut done_rx, &mut worker_shutdown).await;
        }));
    }

    let router_handle = {
        let task_tx = task_tx.clone();
        let mut done_rx = done_rx.clone();
        let mut router_shutdown = shutdown.resubscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = router_shutdown.recv() => return,
                    changed = done_rx.changed() => {
                        if changed.is_err() || *done_rx.borrow() {
                            return;
                        }
                    }
                    received = retry_rx.recv() => {
                        match received {
                            // `process_batch` only ever sends a task here after
                            // checking its *pre-increment* retry_count against
                            // `retry_limit`; re-checking the post-increment
                            // value here would silently drop the final
                            // permitted retry. Always forward.
                            Some(task) => {
                                if task_tx.send(task).await.is_err() {
                                    return;
                                }
                            }
                            None => return,
                        }
                    }
                }
            }
        })
    };

    // Feed the initial batch directly; retried tasks re-enter via the
    // router's own `task_tx` clone above, which stays open past this point.
    let mut feeder_shutdown = shutdown.resubscribe();
    'feed: for task in tasks {
        tokio::select! {
            result = task_tx.send(task) => {
                if result.is_err() {
                    break 'feed;
                }
            }
            _ = feeder_shutdown.recv() => break 'feed,
        }
    }
    drop(task_tx);

    for handle in worker_handles {
        let _ = handle.await;
    }
    let _ = router_handle.await;
}

async fn run_worker(
    task_rx: Arc<AsyncMutex<mpsc::Receiver<Task>>>,
    retry_tx: mpsc::Sender<Task>,
    options: Arc<DispatchOptions>,
    completion: Arc<Completion>,
    done_rx: &mut watch::Receiver<bool>,
    shutdown: &mut tokio::sync::broadcast::Receiver<bulkmail_common::Signal>,
) {
    let mut session = match Session::connect(&options.smtp).await {
        Ok(session) => session,
        Err(e) => {
            tracing::error!(error = %e, "worker failed to acquire its SMTP session");
            return;
        }
    };

    let mut batch = Vec::with_capacity(options.batch_size);
    loop {
        let recv_one = async {
            let mut guard = task_rx.lock().await;
            guard.recv().await
        };

        tokio::select! {
            biased;
            _ = shutdown.recv() => {
                if !batch.is_empty() {
                    process_batch(&mut session, &options, &completion, &retry_tx, std::mem::take(&mut batch)).await;
                }
                return;
            }
            changed = done_rx.changed(), if *done_rx.borrow() => {
                if changed.is_err() || *done_rx.borrow() {
                    if !batch.is_empty() {
                        process_batch(&mut session, &options, &completion, &retry_tx, std::mem::take(&mut batch)).await;
                    }
                    return;
                }
            }
            received = recv_one => {
                match received {
                    Some(task) => {
                        batch.push(task);
                        if batch.len() >= options.batch_size {
                            process_batch(&mut session, &options, &completion, &retry_tx, std::mem::take(&mut batch)).await;
                        }
                    }
                    None => {
                        if !batch.is_empty() {
                            process_batch(&mut session, &options, &completion, &retry_tx, std::mem::take(&mut batch)).await;
                        }
                        return;
                    }
                }
            }
        }
    }
}

async fn process_batch(
    session: &mut Session,
    options: &Arc<DispatchOptions>,
    completion: &Arc<Completion>,
    retry_tx: &mpsc::Sender<Task>,
    batch: Vec<Task>,
) {
    for task in batch {
        options
            .monitor
            .update_recipient_status(&task.recipient, RecipientState::Sending, Duration::ZERO, "");

        let started = Instant::now();
        match send(session, &options.smtp, &task).await {
            Ok(()) => {
                options
                    .monitor
                    .update_recipient_status(&task.recipient, RecipientState::Sent, started.elapsed(), "250");
                options.monitor.add_smtp_response(&task.recipient, "250");

                if let Some(tracker) = &options.offset_tracker {
                    let _ = tracker.mark_sent(&task.recipient).await;
                    let offset = options.start_offset + task.index + 1;
                    if offset % 10 == 0 {
                        let _ = tracker.flush().await;
                    }
                }
                completion.mark_terminal();
            }
            Err(e) => {
                let code = extract_smtp_code(&e.to_string());
                options.monitor.add_smtp_response(&task.recipient, &code);

                if task.retry_count < options.retry_limit {
                    options
                        .monitor
                        .update_recipient_status(&task.recipient, RecipientState::Retry, started.elapsed(), &code);
                    schedule_retry(task, options.max_backoff, retry_tx.clone());
                } else {
                    options
                        .monitor
                        .update_recipient_status(&task.recipient, RecipientState::Failed, started.elapsed(), &code);
                    completion.mark_terminal();
                }
            }
        }
    }

    if let Some(tracker) = &options.offset_tracker {
        let _ = tracker.flush().await;
    }
}

/// `delay = min(2^retryCount seconds, maxBackoff) + uniformJitter(0, 1000ms)`.
/// The retry re-enters the pipeline via `retryChan`; whether it is actually
/// re-attempted or dropped as permanently failed is the router's decision,
/// not this scheduling step's.
fn schedule_retry(mut task: Task, max_backoff: Duration, retry_tx: mpsc::Sender<Task>) {
    task.retry_count += 1;
    let exponent = task.retry_count.min(32);
    let base = Duration::from_secs(1u64.checked_shl(exponent).unwrap_or(u64::MAX)).min(max_backoff);
    let jitter = Duration::from_millis(rand::rng().random_range(0..1000));
    let delay = base + jitter;

    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = retry_tx.send(task).await;
    });
}

async fn send(session: &mut Session, config: &SmtpConfig, task: &Task) -> Result<(), Error> {
    let mail_from = session.command(&format!("MAIL FROM:<{}>", config.from)).await?;
    require_success(&mail_from, "MAIL FROM")?;

    let rcpt = session.command(&format!("RCPT TO:<{}>", task.recipient)).await?;
    require_success(&rcpt, "RCPT TO")?;

    for cc in &task.cc {
        let response = session.command(&format!("RCPT TO:<{cc}>")).await?;
        require_success(&response, "RCPT TO (cc)")?;
    }
    for bcc in &task.bcc {
        let response = session.command(&format!("RCPT TO:<{bcc}>")).await?;
        require_success(&response, "RCPT TO (bcc)")?;
    }

    let data = session.command("DATA").await?;
    require_success(&data, "DATA")?;

    let message = build_message(config, task);
    let response = session.send_data(&message).await?;
    require_success(&response, "end of DATA")?;

    Ok(())
}

fn require_success(response: &bulkmail_smtp::Response, step: &str) -> Result<(), Error> {
    if response.is_success() {
        Ok(())
    } else {
        Err(Error::transport(
            bulkmail_common::error::ErrorKind::Unknown,
            format!("{step} rejected: {} {}", response.code, response.message()),
        ))
    }
}

fn build_message(config: &SmtpConfig, task: &Task) -> String {
    let mut headers = String::new();
    headers.push_str(&format!("From: {}\r\n", config.from));
    headers.push_str(&format!("To: {}\r\n", task.recipient));
    if !task.cc.is_empty() {
        let cc_list = task.cc.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ");
        headers.push_str(&format!("Cc: {cc_list}\r\n"));
    }
    headers.push_str(&format!("Subject: {}\r\n", task.subject));
    headers.push_str("MIME-Version: 1.0\r\n");

    if task.attachments.is_empty() {
        headers.push_str("Content-Type: text/html; charset=\"UTF-8\"\r\n\r\n");
        headers.push_str(task.body_html.as_deref().unwrap_or(""));
        headers
    } else {
        let boundary = "----=_bulkmail_boundary";
        headers.push_str(&format!("Content-Type: multipart/mixed; boundary=\"{boundary}\"\r\n\r\n"));

        if let Some(body) = &task.body_html {
            headers.push_str(&format!("--{boundary}\r\n"));
            headers.push_str("Content-Type: text/html; charset=\"UTF-8\"\r\n\r\n");
            headers.push_str(body);
            headers.push_str("\r\n");
        }

        for attachment in &task.attachments {
            headers.push_str(&format!("--{boundary}\r\n"));
            headers.push_str(&format!(
                "Content-Type: {}; name=\"{}\"\r\n",
                attachment.resolved_content_type(),
                attachment.filename
            ));
            headers.push_str("Content-Transfer-Encoding: base64\r\n");
            headers.push_str(&format!(
                "Content-Disposition: attachment; filename=\"{}\"\r\n\r\n",
                attachment.filename
            ));
            headers.push_str(&base64::engine::general_purpose::STANDARD.encode(&attachment.bytes));
            headers.push_str("\r\n");
        }

        headers.push_str(&format!("--{boundary}--\r\n"));
        headers
    }
}
