//! Email address newtype plus domain extraction.

use std::{
    fmt::{self, Display},
    sync::Arc,
};

use serde::{Deserialize, Serialize};

use crate::domain::Domain;

/// An email address, stored verbatim (no normalization beyond trimming).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Email(Arc<str>);

impl Email {
    #[must_use]
    pub fn new(s: impl Into<Arc<str>>) -> Self {
        Self(s.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Extract the domain portion of the address (the part after the last `@`).
    ///
    /// Addresses without an `@` yield a domain equal to the whole string;
    /// callers rely on this never failing so that malformed addresses still
    /// get a deterministic per-domain bucket.
    #[must_use]
    pub fn domain(&self) -> Domain {
        match self.0.rsplit_once('@') {
            Some((_, domain)) => Domain::new(domain),
            None => Domain::new(self.0.as_ref()),
        }
    }
}

impl Display for Email {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for Email {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

impl From<&str> for Email {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_extraction() {
        let e = Email::new("alice@example.com");
        assert_eq!(e.domain().as_str(), "example.com");
    }

    #[test]
    fn domain_extraction_without_at_is_total() {
        let e = Email::new("not-an-email");
        assert_eq!(e.domain().as_str(), "not-an-email");
    }

    #[test]
    fn domain_extraction_uses_last_at() {
        let e = Email::new("a@b@example.com");
        assert_eq!(e.domain().as_str(), "example.com");
    }
}
