//! Deterministic substring-based mapping from an error's textual form
//! (lowercased) to an `ErrorKind`. First-hit in a fixed declaration order,
//! case-insensitive, no I/O. Dispatches on substrings rather than on a typed
//! source error, since the dispatch engine and the SMTP client both only
//! have the transport's textual response to work with.

use bulkmail_common::error::ErrorKind;

/// Ordered substring → kind table. Order matters: `classify` returns the
/// kind of the first matching entry.
const TOKENS: &[(&str, ErrorKind)] = &[
    ("connection refused", ErrorKind::Network),
    ("timeout", ErrorKind::Network),
    ("authentication", ErrorKind::Auth),
    ("quota", ErrorKind::Quota),
    ("rate limit", ErrorKind::Quota),
    ("temporary", ErrorKind::Temporary),
    ("mailbox unavailable", ErrorKind::Temporary),
    ("invalid recipient", ErrorKind::Permanent),
    ("permanent failure", ErrorKind::Permanent),
];

/// Classify an error's textual form into an abstract `ErrorKind`.
///
/// `classify(None) == ErrorKind::Unknown`. Matching is case-insensitive and
/// first-hit in `TOKENS`'s declaration order.
#[must_use]
pub fn classify(message: Option<&str>) -> ErrorKind {
    let Some(message) = message else {
        return ErrorKind::Unknown;
    };
    let lowered = message.to_ascii_lowercase();
    for (token, kind) in TOKENS {
        if lowered.contains(token) {
            return *kind;
        }
    }
    ErrorKind::Unknown
}
