//! Error taxonomy shared across the dispatch, resilience, and scheduler
//! crates.
//!
//! Every crate boundary composes this enum with `#[from]` so `?` propagates
//! cleanly.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Abstract classification of a transport-level failure.
///
/// Deliberately coarse: the classifier maps arbitrary error text onto one of
/// these six kinds, and the retry policy only ever reasons about the kind,
/// never the original error string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Network,
    Auth,
    Quota,
    Temporary,
    Permanent,
    Unknown,
}

impl ErrorKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Auth => "auth",
            Self::Quota => "quota",
            Self::Temporary => "temporary",
            Self::Permanent => "permanent",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The top-level error type for the bulkmail core.
#[derive(Debug, Error)]
pub enum Error {
    /// The circuit breaker is currently open; callers must not treat this
    /// as retryable on their own — it already encodes "do not retry right
    /// now".
    #[error("circuit open, next attempt permitted at a later time")]
    CircuitOpen,

    /// The SMTP session pool has been shut down.
    #[error("session pool is closed")]
    PoolClosed,

    /// The SMTP session pool could not produce a session within
    /// `maxWaitTime` and is already at `maxSize`.
    #[error("session pool exhausted")]
    PoolExhausted,

    /// A pooled session's idle age exceeded `maxIdleTime` or it failed a
    /// health-check round-trip.
    #[error("smtp session is stale: {0}")]
    ConnectionStale(String),

    /// An attachment exceeded `max_attachment_size`.
    #[error("attachment {name:?} is {size} bytes, exceeding the {limit} byte limit")]
    AttachmentTooLarge {
        name: String,
        size: u64,
        limit: u64,
    },

    /// An attachment's content type could not be determined or is
    /// disallowed.
    #[error("unsupported attachment type for {0:?}")]
    UnsupportedAttachmentType(String),

    /// The job store has no record for the given id.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// A job's `cron_expr` failed to parse as a 5-field cron expression.
    #[error("invalid cron expression {0:?}: {1}")]
    InvalidCronExpression(String, String),

    /// A lease value could not be parsed as `<instance-id>:<acquired-at-nanos>`.
    #[error("malformed lock value: {0:?}")]
    MalformedLock(String),

    /// An offset-file line matched neither the canonical nor legacy shape.
    #[error("corrupt offset line: {0:?}")]
    CorruptOffsetLine(String),

    /// Configuration failed range validation.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// An I/O error occurred (offset file, job store file, SMTP socket).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A raw transport error, classified as `kind`, carrying its original
    /// text for logging (not for further string matching downstream).
    #[error("{kind}: {message}")]
    Transport { kind: ErrorKind, message: String },

    /// An internal invariant was violated; these should never surface to a
    /// well-behaved caller.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Construct a transport error with a pre-computed classification.
    #[must_use]
    pub fn transport(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Transport {
            kind,
            message: message.into(),
        }
    }

    /// Best-effort classification of this error, for callers that need a
    /// kind even for non-`Transport` variants.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Transport { kind, .. } => *kind,
            Self::CircuitOpen => ErrorKind::Unknown,
            Self::Io(_) => ErrorKind::Network,
            _ => ErrorKind::Permanent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_display() {
        assert_eq!(ErrorKind::Network.to_string(), "network");
        assert_eq!(ErrorKind::Unknown.to_string(), "unknown");
    }

    #[test]
    fn transport_error_carries_kind() {
        let err = Error::transport(ErrorKind::Quota, "rate limit exceeded");
        assert_eq!(err.kind(), ErrorKind::Quota);
        assert_eq!(err.to_string(), "quota: rate limit exceeded");
    }

    #[test]
    fn circuit_open_is_distinguished() {
        let err = Error::CircuitOpen;
        assert!(matches!(err, Error::CircuitOpen));
    }
}
