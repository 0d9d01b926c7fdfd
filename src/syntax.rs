//! Minimal syntactic gate for candidate addresses.
//!
//! The pipeline only needs the local part and the domain split apart;
//! everything deeper is the mail exchanger's call to make.

use std::fmt;

/// An address accepted by the gate: exactly one `@`, both sides non-empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Address {
    pub local: String,
    pub domain: String,
}

impl Address {
    /// Split `raw` on `@` after trimming. The domain is lowercased; the
    /// local part is kept as given.
    pub fn parse(raw: &str) -> Option<Self> {
        let input = raw.trim();
        let (local, domain) = input.split_once('@')?;
        if local.is_empty() || domain.is_empty() || domain.contains('@') {
            return None;
        }
        Some(Self {
            local: local.to_string(),
            domain: domain.to_ascii_lowercase(),
        })
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.local, self.domain)
    }
}
