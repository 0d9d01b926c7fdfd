use thiserror::Error;
use trust_dns_resolver::error::ResolveError;

/// Classification bucket for a failed MX resolution. Hard kinds end the
/// run immediately; the rest are retried and failed over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsErrorKind {
    HardFail,
    SoftFail,
    Timeout,
    NoMxRecords,
    InvalidDomain,
}

impl DnsErrorKind {
    /// Whether this kind terminates retries and tier failover.
    pub fn is_hard(self) -> bool {
        matches!(
            self,
            Self::HardFail | Self::InvalidDomain | Self::NoMxRecords
        )
    }
}

/// A classified MX resolution failure, keeping the resolver error that
/// produced it.
#[derive(Debug, Error)]
pub enum DnsError {
    #[error("domain does not exist: {domain}")]
    HardFail {
        domain: String,
        #[source]
        source: ResolveError,
    },
    #[error("resolver failure: {message}")]
    SoftFail {
        message: String,
        #[source]
        source: Option<ResolveError>,
    },
    #[error("DNS query timed out for {domain}")]
    Timeout {
        domain: String,
        #[source]
        source: ResolveError,
    },
    #[error("no MX records found for {0}")]
    NoMxRecords(String),
    #[error("invalid domain name: {domain:?}")]
    InvalidDomain {
        domain: String,
        #[source]
        source: Option<idna::Errors>,
    },
}

impl DnsError {
    pub fn kind(&self) -> DnsErrorKind {
        match self {
            Self::HardFail { .. } => DnsErrorKind::HardFail,
            Self::SoftFail { .. } => DnsErrorKind::SoftFail,
            Self::Timeout { .. } => DnsErrorKind::Timeout,
            Self::NoMxRecords(_) => DnsErrorKind::NoMxRecords,
            Self::InvalidDomain { .. } => DnsErrorKind::InvalidDomain,
        }
    }

    pub fn is_hard(&self) -> bool {
        self.kind().is_hard()
    }

    pub(crate) fn soft(message: impl Into<String>) -> Self {
        Self::SoftFail {
            message: message.into(),
            source: None,
        }
    }

    pub(crate) fn invalid_domain(domain: impl Into<String>) -> Self {
        Self::InvalidDomain {
            domain: domain.into(),
            source: None,
        }
    }
}
