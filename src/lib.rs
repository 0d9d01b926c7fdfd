#![forbid(unsafe_code)]
//! mailprobe — SMTP mailbox deliverability probing without sending mail.
//!
//! The crate resolves a recipient domain's mail exchangers, connects to the
//! preferred one (directly or through a SOCKS5 proxy), and drives an SMTP
//! dialogue up to `RCPT TO` to observe the server's verdict. A randomized
//! catch-all probe issued before the target recipient distinguishes genuine
//! acceptance from domains that accept everything.

pub mod config;
pub mod mx;
pub mod smtp;
pub mod syntax;
pub mod verifier;

pub use config::{DnsTiers, JitterBands, ProxyConfig, VerifierConfig};
pub use verifier::{verify_email, PublicResult, Status, Verdict, VerdictDetails, Verifier};

/// Target used for all `tracing` events emitted by this crate.
pub const LOG_TARGET: &str = "mailprobe";
