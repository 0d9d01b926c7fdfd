//! Shared configuration for the verification pipeline.
//!
//! A [`VerifierConfig`] is built once, then passed explicitly to whatever
//! needs it. It is never mutated after construction.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Knobs for a verification run: timeouts, delay bounds, DNS tiers, SMTP
/// port, HELO identity, and an optional SOCKS5 proxy.
#[derive(Debug, Clone)]
pub struct VerifierConfig {
    /// Deadline for a single DNS query.
    pub dns_timeout: Duration,
    /// Extra queries per resolver tier after the first one fails softly.
    pub dns_retries: u32,
    /// Name server tiers tried in order during MX resolution.
    pub dns_tiers: DnsTiers,
    /// Deadline for establishing the TCP connection.
    pub connect_timeout: Duration,
    /// Deadline for the whole SOCKS5 handshake, budgeted separately from
    /// the SMTP banner so failures attribute to the right side.
    pub proxy_timeout: Duration,
    /// Deadline for receiving the `220` service banner.
    pub banner_timeout: Duration,
    /// Deadline for each SMTP command/response exchange.
    pub command_timeout: Duration,
    /// Ceiling on the lifetime of one connection, banner to QUIT.
    pub session_lifetime: Duration,
    /// Port the mail exchangers are contacted on.
    pub smtp_port: u16,
    /// Name announced in `EHLO`/`HELO`.
    pub helo_name: String,
    /// Envelope sender for `MAIL FROM`. When unset, a
    /// `verify@<recipient domain>` placeholder is synthesised.
    pub sender_email: Option<String>,
    /// Randomized pre-command delay bounds.
    pub jitter: JitterBands,
    /// Optional SOCKS5 proxy for the SMTP connection.
    pub proxy: Option<ProxyConfig>,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            dns_timeout: Duration::from_secs(5),
            dns_retries: 2,
            dns_tiers: DnsTiers::default(),
            connect_timeout: Duration::from_secs(5),
            proxy_timeout: Duration::from_secs(10),
            banner_timeout: Duration::from_secs(5),
            command_timeout: Duration::from_secs(10),
            session_lifetime: Duration::from_secs(30),
            smtp_port: 25,
            helo_name: "verify.example.com".to_string(),
            sender_email: None,
            jitter: JitterBands::default(),
            proxy: None,
        }
    }
}

impl VerifierConfig {
    /// Envelope sender used in `MAIL FROM`, falling back to a probe
    /// identity under the recipient's own domain.
    pub fn sender_for(&self, recipient_domain: &str) -> String {
        self.sender_email
            .as_ref()
            .filter(|value| !value.is_empty())
            .cloned()
            .unwrap_or_else(|| format!("verify@{recipient_domain}"))
    }
}

/// Name server tiers for MX resolution, tried in order until one yields
/// records or a hard failure ends the run.
#[derive(Debug, Clone)]
pub struct DnsTiers {
    pub primary: Vec<SocketAddr>,
    pub fallback: Vec<SocketAddr>,
    pub secondary: Vec<SocketAddr>,
}

impl Default for DnsTiers {
    fn default() -> Self {
        Self {
            primary: vec![dns_addr(Ipv4Addr::new(1, 1, 1, 1))],
            fallback: vec![dns_addr(Ipv4Addr::new(8, 8, 8, 8))],
            secondary: vec![
                dns_addr(Ipv4Addr::new(1, 0, 0, 1)),
                dns_addr(Ipv4Addr::new(8, 8, 4, 4)),
            ],
        }
    }
}

impl DnsTiers {
    /// The tiers in failover order.
    pub fn as_slices(&self) -> [&[SocketAddr]; 3] {
        [&self.primary, &self.fallback, &self.secondary]
    }
}

fn dns_addr(ip: Ipv4Addr) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(ip), 53)
}

/// Uniform delay bounds, in milliseconds, applied before each client
/// command to avoid tripping rate heuristics.
#[derive(Debug, Clone)]
pub struct JitterBands {
    pub ehlo: (u64, u64),
    pub helo: (u64, u64),
    pub mail_from: (u64, u64),
    pub rcpt_to: (u64, u64),
}

impl Default for JitterBands {
    fn default() -> Self {
        Self {
            ehlo: (100, 500),
            helo: (200, 400),
            mail_from: (150, 800),
            rcpt_to: (100, 600),
        }
    }
}

impl JitterBands {
    /// All-zero bands; used by tests that must not sleep.
    pub fn none() -> Self {
        Self {
            ehlo: (0, 0),
            helo: (0, 0),
            mail_from: (0, 0),
            rcpt_to: (0, 0),
        }
    }
}

/// A SOCKS5 proxy endpoint with optional username/password credentials.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ProxyConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
        }
    }

    /// Credentials when both halves are present and non-empty.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() => Some((user, pass)),
            _ => None,
        }
    }
}
