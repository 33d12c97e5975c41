//! The standard `JobHandler`: decodes a job's payload as campaign arguments
//! and drives the pipeline adapter plus the dispatch engine. Recipient
//! parsing (CSV/spreadsheet ingestion) and template rendering are left to
//! callers upstream of this handler — a campaign's recipients and templates
//! arrive here already resolved to paths and flat attribute maps.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bulkmail_common::config::SmtpConfig;
use bulkmail_common::email::Email;
use bulkmail_common::error::{Error, Result};
use bulkmail_common::Signal;
use bulkmail_dispatch::{
    Attachment, DispatchOptions, Monitor, OffsetTracker, PipelineInput, RecipientContext,
    Renderer, TemplateCache, TemplateCacheConfig,
};
use bulkmail_scheduler::{Job, JobHandler};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// One recipient's address plus the flat attribute map the renderer
/// resolves placeholders against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignRecipient {
    pub email: String,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

/// An attachment to read from disk and attach to every send in the campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignAttachment {
    pub filename: String,
    pub path: PathBuf,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// The job payload a `CampaignHandler` decodes: one campaign's arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CampaignArgs {
    pub smtp: SmtpConfig,
    pub recipients: Vec<CampaignRecipient>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    pub subject_template: String,
    #[serde(default)]
    pub body_template_path: Option<PathBuf>,
    #[serde(default)]
    pub attachments: Vec<CampaignAttachment>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
    #[serde(default)]
    pub offset_file: Option<PathBuf>,
}

const fn default_concurrency() -> usize {
    5
}

const fn default_batch_size() -> usize {
    50
}

const fn default_retry_limit() -> u32 {
    3
}

const fn default_max_backoff_secs() -> u64 {
    60
}

/// Minimal `{{field}}` substitution, the same contract `pipeline`'s own
/// test double exercises. A richer templating engine is out of scope here;
/// this is the narrow default the standard handler ships with so a
/// campaign job is runnable without a caller supplying one.
struct PlaceholderRenderer;

impl Renderer for PlaceholderRenderer {
    fn render(&self, template: &str, context: &HashMap<String, String>) -> std::result::Result<String, String> {
        let mut out = template.to_string();
        for (key, value) in context {
            out = out.replace(&format!("{{{{{key}}}}}"), value);
        }
        if out.contains("{{") {
            return Err(format!("unresolved placeholder in {out:?}"));
        }
        Ok(out)
    }
}

/// Decodes a campaign payload and drives the pipeline adapter, then the
/// dispatch engine.
pub struct CampaignHandler {
    monitor: Arc<Monitor>,
    template_cache: Arc<TemplateCache>,
    shutdown: broadcast::Sender<Signal>,
}

impl CampaignHandler {
    #[must_use]
    pub fn new(
        monitor: Arc<Monitor>,
        template_cache: Arc<TemplateCache>,
        shutdown: broadcast::Sender<Signal>,
    ) -> Self {
        Self {
            monitor,
            template_cache,
            shutdown,
        }
    }

    /// The monitor this handler reports campaign progress through, exposed
    /// so a caller (or a test) can inspect counters after `handle` returns.
    #[must_use]
    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    /// The default handler `reattach_handlers` is wired with at startup,
    /// so jobs a previous process persisted resume against a handler with
    /// the same shape, not a caller-supplied closure that no longer exists.
    #[must_use]
    pub fn default_handler(shutdown: broadcast::Sender<Signal>) -> Arc<dyn JobHandler> {
        Arc::new(Self::new(
            Arc::new(Monitor::new()),
            Arc::new(TemplateCache::new(TemplateCacheConfig::default())),
            shutdown,
        ))
    }
}

#[async_trait]
impl JobHandler for CampaignHandler {
    async fn handle(&self, job: &Job) -> Result<()> {
        let args: CampaignArgs = serde_json::from_slice(&job.payload)
            .map_err(|e| Error::Internal(format!("malformed campaign payload: {e}")))?;

        let offset_tracker = match &args.offset_file {
            Some(path) => {
                let tracker = Arc::new(OffsetTracker::new(path.clone()));
                tracker.load().await?;
                Some(tracker)
            }
            None => None,
        };

        let recipients: Vec<(Email, RecipientContext)> = args
            .recipients
            .into_iter()
            .filter_map(|r| {
                let email = Email::from(r.email);
                if let Some(tracker) = &offset_tracker {
                    if tracker.is_sent(&email) {
                        return None;
                    }
                }
                let mut context = r.attributes;
                context.entry("email".to_string()).or_insert_with(|| email.to_string());
                Some((email, context))
            })
            .collect();

        let mut attachments = Vec::with_capacity(args.attachments.len());
        for attachment in &args.attachments {
            let bytes = tokio::fs::read(&attachment.path).await.map_err(Error::Io)?;
            attachments.push(Attachment {
                filename: attachment.filename.clone(),
                bytes,
                content_type: attachment.content_type.clone(),
            });
        }

        let input = PipelineInput {
            recipients,
            body_template_path: args.body_template_path.as_deref(),
            subject_template: &args.subject_template,
            attachments,
            cc: args.cc.into_iter().map(Email::from).collect(),
            bcc: args.bcc.into_iter().map(Email::from).collect(),
        };

        let tasks = bulkmail_dispatch::pipeline::run(input, &PlaceholderRenderer, &self.template_cache).await;

        let options = DispatchOptions {
            smtp: args.smtp,
            concurrency: args.concurrency.max(1),
            batch_size: args.batch_size.max(1),
            retry_limit: args.retry_limit,
            max_backoff: Duration::from_secs(args.max_backoff_secs),
            monitor: Arc::clone(&self.monitor),
            offset_tracker,
            start_offset: 0,
        };

        bulkmail_dispatch::run_dispatch(tasks, options, self.shutdown.subscribe()).await;
        Ok(())
    }
}
