//! Turns a recipient list plus templates into a filtered, rendered sequence
//! of `Task`s.
//!
//! Template rendering itself is out of scope here; this module only
//! orchestrates calls into whatever `Renderer` is wired in and the template
//! cache, dropping recipients whose data is incomplete or whose render
//! fails.

use std::collections::HashMap;
use std::path::Path;

use bulkmail_common::email::Email;
use tracing::warn;

use crate::task::{Attachment, Task};
use crate::template_cache::TemplateCache;

/// Renders a small string template (e.g. `"Hi {{name}}"`) against a flat
/// attribute map. Left abstract so the CLI/templating surface (out of
/// scope here) can plug in its own engine; the pipeline only needs this
/// narrow contract.
pub trait Renderer {
    /// # Errors
    /// Returns an error description on malformed templates or missing
    /// required placeholders.
    fn render(&self, template: &str, context: &HashMap<String, String>) -> Result<String, String>;
}

/// One recipient's flat attribute map, always containing at least `email`.
pub type RecipientContext = HashMap<String, String>;

/// Pipeline adapter inputs.
pub struct PipelineInput<'a> {
    pub recipients: Vec<(Email, RecipientContext)>,
    pub body_template_path: Option<&'a Path>,
    pub subject_template: &'a str,
    pub attachments: Vec<Attachment>,
    pub cc: Vec<Email>,
    pub bcc: Vec<Email>,
}

/// Runs the pipeline, producing one `Task` per recipient that survives
/// filtering and rendering, in filtered order.
pub async fn run<R: Renderer>(
    input: PipelineInput<'_>,
    renderer: &R,
    template_cache: &TemplateCache,
) -> Vec<Task> {
    let body_template = match input.body_template_path {
        Some(path) => match template_cache.get(path).await {
            Ok(template) => Some(template),
            Err(e) => {
                warn!(error = %e, path = %path.display(), "failed to load body template, dropping entire send");
                None
            }
        },
        None => None,
    };

    if input.body_template_path.is_some() && body_template.is_none() {
        return Vec::new();
    }

    let mut tasks = Vec::with_capacity(input.recipients.len());
    let mut index = 0usize;

    for (email, context) in input.recipients {
        if context.values().any(|v| v.is_empty()) {
            warn!(%email, "dropping recipient with a missing (empty) attribute field");
            continue;
        }

        let body_html = match &body_template {
            Some(template) => match renderer.render(&template.source, &context) {
                Ok(rendered) => Some(rendered),
                Err(e) => {
                    warn!(%email, error = %e, "dropping recipient: body render failed");
                    continue;
                }
            },
            None => None,
        };

        let subject = match renderer.render(input.subject_template, &context) {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!(%email, error = %e, "dropping recipient: subject render failed");
                continue;
            }
        };

        tasks.push(Task {
            recipient: email,
            cc: input.cc.clone(),
            bcc: input.bcc.clone(),
            subject,
            body_html,
            attachments: input.attachments.clone(),
            retry_count: 0,
            index,
        });
        index += 1;
    }

    tasks
}
