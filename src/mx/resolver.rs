use std::net::SocketAddr;
use std::sync::LazyLock;
use std::thread;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, warn};
use trust_dns_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::{ResolveError, ResolveErrorKind};
use trust_dns_resolver::proto::op::ResponseCode;
use trust_dns_resolver::Resolver;

use crate::config::DnsTiers;
use crate::LOG_TARGET;

use super::{DnsError, DnsErrorKind, MxRecord};

/// Base for the soft-failure backoff: 500 ms doubled per attempt.
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Hostname shape gate: LDH labels of 1–63 characters, at least one dot.
static DOMAIN_SHAPE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?\.)+[A-Za-z0-9](?:[A-Za-z0-9-]{0,61}[A-Za-z0-9])?$",
    )
    .expect("domain pattern is valid")
});

/// A successful resolution: sorted records plus the 1-based tier that
/// served the answer.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub records: Vec<MxRecord>,
    pub tier: usize,
}

/// Resolves MX records against the configured tiers. Cheap to share: the
/// underlying resolvers are built per query, so one value serves many
/// concurrent verifications.
#[derive(Debug, Clone)]
pub struct MxResolver {
    tiers: DnsTiers,
    query_timeout: Duration,
    retries: u32,
}

impl MxResolver {
    pub fn new(tiers: DnsTiers, query_timeout: Duration, retries: u32) -> Self {
        Self {
            tiers,
            query_timeout,
            retries,
        }
    }

    /// Resolve the MX records for `domain`. On success the record list is
    /// non-empty and sorted by ascending priority.
    pub fn resolve(&self, domain: &str) -> Result<Resolution, DnsError> {
        let ascii = normalize_domain(domain)?;
        let tiers: Vec<ClearnetTier<'_>> = self
            .tiers
            .as_slices()
            .into_iter()
            .map(|servers| ClearnetTier {
                servers,
                timeout: self.query_timeout,
            })
            .collect();
        resolve_with(&tiers, &ascii, self.retries, BACKOFF_BASE)
    }
}

/// Validate and IDNA-normalize a domain before it goes anywhere near DNS.
pub(crate) fn normalize_domain(domain: &str) -> Result<String, DnsError> {
    let trimmed = domain.trim().trim_end_matches('.');
    if trimmed.is_empty() {
        return Err(DnsError::invalid_domain(trimmed));
    }
    let ascii = idna::domain_to_ascii(trimmed).map_err(|source| DnsError::InvalidDomain {
        domain: trimmed.to_string(),
        source: Some(source),
    })?;
    if ascii.len() > 253 || !DOMAIN_SHAPE.is_match(&ascii) {
        return Err(DnsError::invalid_domain(trimmed));
    }
    Ok(ascii)
}

pub(crate) fn normalize_exchange(exchange: String) -> String {
    exchange.trim_end_matches('.').to_ascii_lowercase()
}

/// One query against one name-server set.
pub(crate) trait LookupMx {
    fn lookup_mx(&self, domain: &str) -> Result<Vec<MxRecord>, ResolveError>;
}

/// A tier of explicit clearnet name servers. Builds its resolver per
/// query, the failure of which classifies like any other soft failure.
struct ClearnetTier<'a> {
    servers: &'a [SocketAddr],
    timeout: Duration,
}

impl LookupMx for ClearnetTier<'_> {
    fn lookup_mx(&self, domain: &str) -> Result<Vec<MxRecord>, ResolveError> {
        let ips: Vec<_> = self.servers.iter().map(|addr| addr.ip()).collect();
        let port = self.servers.first().map_or(53, |addr| addr.port());
        let group = NameServerConfigGroup::from_ips_clear(&ips, port, true);
        let config = ResolverConfig::from_parts(None, Vec::new(), group);
        let mut opts = ResolverOpts::default();
        opts.timeout = self.timeout;
        // retries and their classification belong to resolve_with
        opts.attempts = 0;
        let resolver = Resolver::new(config, opts)
            .map_err(|err| ResolveError::from(ResolveErrorKind::Io(err)))?;
        let lookup = resolver.mx_lookup(domain)?;
        Ok(lookup
            .iter()
            .map(|mx| {
                MxRecord::new(
                    normalize_exchange(mx.exchange().to_utf8()),
                    Some(mx.preference()),
                )
            })
            .collect())
    }
}

/// Tier failover around [`query_tier`]: hard failures short-circuit, soft
/// exhaustion moves on to the next tier.
pub(crate) fn resolve_with<R: LookupMx>(
    tiers: &[R],
    ascii_domain: &str,
    retries: u32,
    backoff_base: Duration,
) -> Result<Resolution, DnsError> {
    let mut last_soft = None;
    for (index, tier) in tiers.iter().enumerate() {
        let tier_no = index + 1;
        match query_tier(tier, ascii_domain, retries, backoff_base) {
            Ok(records) => {
                debug!(
                    target: LOG_TARGET,
                    domain = ascii_domain,
                    tier = tier_no,
                    count = records.len(),
                    "MX resolution succeeded"
                );
                return Ok(Resolution {
                    records,
                    tier: tier_no,
                });
            }
            Err(err) if err.is_hard() => return Err(err),
            Err(err) => {
                warn!(
                    target: LOG_TARGET,
                    domain = ascii_domain,
                    tier = tier_no,
                    error = %err,
                    "resolver tier exhausted, failing over"
                );
                last_soft = Some(err);
            }
        }
    }
    Err(last_soft.unwrap_or_else(|| DnsError::soft("no resolver tiers configured")))
}

fn query_tier<R: LookupMx>(
    tier: &R,
    domain: &str,
    retries: u32,
    backoff_base: Duration,
) -> Result<Vec<MxRecord>, DnsError> {
    let attempts = retries + 1;
    let mut last = None;
    for attempt in 1..=attempts {
        if attempt > 1 {
            thread::sleep(backoff_base * 2u32.pow(attempt - 2));
        }
        match tier.lookup_mx(domain) {
            Ok(records) if records.is_empty() => {
                return Err(DnsError::NoMxRecords(domain.to_string()));
            }
            Ok(mut records) => {
                // stable sort: equal priorities keep source order
                records.sort_by_key(|record| record.priority);
                return Ok(records);
            }
            Err(err) => {
                let classified = classify(domain, err);
                if classified.is_hard() {
                    return Err(classified);
                }
                last = Some(classified);
            }
        }
    }
    Err(last.unwrap_or_else(|| DnsError::soft(format!("no query attempted for {domain}"))))
}

fn classify(domain: &str, err: ResolveError) -> DnsError {
    let kind = match err.kind() {
        ResolveErrorKind::NoRecordsFound { response_code, .. } => match response_code {
            ResponseCode::NXDomain => DnsErrorKind::HardFail,
            ResponseCode::NoError => DnsErrorKind::NoMxRecords,
            _ => DnsErrorKind::SoftFail,
        },
        ResolveErrorKind::Timeout => DnsErrorKind::Timeout,
        ResolveErrorKind::Io(io) if io.kind() == std::io::ErrorKind::TimedOut => {
            DnsErrorKind::Timeout
        }
        _ => DnsErrorKind::SoftFail,
    };
    match kind {
        DnsErrorKind::HardFail => DnsError::HardFail {
            domain: domain.to_string(),
            source: err,
        },
        DnsErrorKind::NoMxRecords => DnsError::NoMxRecords(domain.to_string()),
        DnsErrorKind::Timeout => DnsError::Timeout {
            domain: domain.to_string(),
            source: err,
        },
        _ => DnsError::SoftFail {
            message: format!("MX lookup for {domain} failed"),
            source: Some(err),
        },
    }
}
