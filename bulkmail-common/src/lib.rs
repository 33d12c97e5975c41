//! Shared types, error taxonomy, configuration, and logging setup used
//! throughout the bulkmail dispatch/scheduler core.

pub mod config;
pub mod domain;
pub mod email;
pub mod error;
pub mod logging;
pub mod signal;

pub use config::Config;
pub use domain::Domain;
pub use email::Email;
pub use error::{Error, Result};
pub use signal::Signal;

/// Re-export of `tracing` so downstream crates depend on one pinned copy.
pub use tracing;
