//! Dispatch engine and its collaborators: the template cache, offset
//! tracker, dispatch engine, monitor sink, and pipeline adapter.

pub mod engine;
pub mod monitor;
pub mod offset_tracker;
pub mod pipeline;
pub mod task;
pub mod template_cache;

pub use engine::{DispatchOptions, run as run_dispatch};
pub use monitor::{Monitor, NullMonitor, RecipientState, RecipientUpdate};
pub use offset_tracker::OffsetTracker;
pub use pipeline::{PipelineInput, RecipientContext, Renderer};
pub use task::{Attachment, Task};
pub use template_cache::{spawn_eviction_task, Template, TemplateCache, TemplateCacheConfig};
