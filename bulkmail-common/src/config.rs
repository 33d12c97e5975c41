//! Configuration record consumed by the core.
//!
//! The core never parses JSON/TOML itself — loading config from a file or
//! environment is left to the binary crate. This module only defines the
//! struct shape with `serde` defaults and validates field ranges at
//! construction.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub smtp: SmtpConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub limits: SafetyLimits,
}

impl Config {
    /// Validate all range-constrained fields, returning a `Configuration`
    /// error describing the first violation found.
    ///
    /// # Errors
    /// Returns `Error::Configuration` if any field is outside its documented
    /// range.
    pub fn validate(&self) -> Result<()> {
        self.smtp.validate()?;
        self.limits.validate()?;
        Ok(())
    }
}

/// SMTP connection parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub username: String,
    pub password: String,
    pub from: String,
    #[serde(default)]
    pub use_tls: bool,
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default = "defaults::connection_timeout_secs")]
    pub connection_timeout_secs: u64,
    #[serde(default = "defaults::read_timeout_secs")]
    pub read_timeout_secs: u64,
    #[serde(default = "defaults::write_timeout_secs")]
    pub write_timeout_secs: u64,
}

impl SmtpConfig {
    /// Effective port: the configured value, or 587/25 depending on
    /// `use_tls` when unset.
    #[must_use]
    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(if self.use_tls { 587 } else { 25 })
    }

    fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Configuration("smtp.host must not be empty".into()));
        }
        if self.from.trim().is_empty() {
            return Err(Error::Configuration("smtp.from must not be empty".into()));
        }
        Ok(())
    }
}

mod defaults {
    pub const fn connection_timeout_secs() -> u64 {
        10
    }

    pub const fn read_timeout_secs() -> u64 {
        30
    }

    pub const fn write_timeout_secs() -> u64 {
        30
    }
}

/// Logging configuration, consumed by `bulkmail_common::logging`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Safety limits: bounds on concurrency, batching, attachments, retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyLimits {
    #[serde(default)]
    pub rate_limit: Option<u32>,
    #[serde(default)]
    pub burst_limit: Option<u32>,
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_max_attachment_size")]
    pub max_attachment_size: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

const fn default_max_concurrency() -> usize {
    5
}

const fn default_max_batch_size() -> usize {
    50
}

const fn default_max_attachment_size() -> u64 {
    25 * 1024 * 1024
}

const fn default_max_retries() -> u32 {
    3
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            rate_limit: None,
            burst_limit: None,
            max_concurrency: default_max_concurrency(),
            max_batch_size: default_max_batch_size(),
            max_attachment_size: default_max_attachment_size(),
            max_retries: default_max_retries(),
        }
    }
}

impl SafetyLimits {
    fn validate(&self) -> Result<()> {
        if !(1..=100).contains(&self.max_concurrency) {
            return Err(Error::Configuration(format!(
                "limits.max_concurrency must be in 1..=100, got {}",
                self.max_concurrency
            )));
        }
        if !(1..=1000).contains(&self.max_batch_size) {
            return Err(Error::Configuration(format!(
                "limits.max_batch_size must be in 1..=1000, got {}",
                self.max_batch_size
            )));
        }
        if !(1..=100 * 1024 * 1024).contains(&self.max_attachment_size) {
            return Err(Error::Configuration(format!(
                "limits.max_attachment_size must be in 1 B..=100 MB, got {}",
                self.max_attachment_size
            )));
        }
        if self.max_retries > 10 {
            return Err(Error::Configuration(format!(
                "limits.max_retries must be in 0..=10, got {}",
                self.max_retries
            )));
        }
        Ok(())
    }
}
