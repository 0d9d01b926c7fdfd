//! End-to-end verification: syntax gate, MX resolution, SMTP probe, and
//! verdict synthesis.
//!
//! The probe deliberately tests a randomly generated alias *before* the
//! target recipient: a server that has already seen the target could
//! memoize it and bias the catch-all signal.

mod report;
mod verdict;

pub use report::PublicResult;
pub use verdict::{Status, Verdict, VerdictDetails};

use rand::Rng;
use thiserror::Error;
use tracing::debug;

use crate::config::VerifierConfig;
use crate::mx::MxResolver;
use crate::smtp::{self, SessionError, SessionStream, SmtpResponse, SmtpSession};
use crate::syntax::Address;
use crate::LOG_TARGET;

/// Verify one address with the default configuration.
pub fn verify_email(email: &str) -> Verdict {
    Verifier::new(VerifierConfig::default()).verify(email)
}

/// Drives the full pipeline. One value serves many concurrent
/// verifications; each call owns its own socket from connect to close.
pub struct Verifier {
    config: VerifierConfig,
    resolver: MxResolver,
}

impl Verifier {
    pub fn new(config: VerifierConfig) -> Self {
        let resolver = MxResolver::new(
            config.dns_tiers.clone(),
            config.dns_timeout,
            config.dns_retries,
        );
        Self { config, resolver }
    }

    pub fn config(&self) -> &VerifierConfig {
        &self.config
    }

    /// Verify a single address. Infallible by design: every failure
    /// becomes an `INVALID` or `UNKNOWN` verdict with a populated reason.
    pub fn verify(&self, email: &str) -> Verdict {
        let Some(address) = Address::parse(email) else {
            return Verdict {
                email: email.to_string(),
                domain: String::new(),
                mx: None,
                status: Status::Invalid,
                reason: "Invalid email syntax".to_string(),
                details: VerdictDetails::default(),
            };
        };

        let resolution = match self.resolver.resolve(&address.domain) {
            Ok(resolution) => resolution,
            Err(err) => {
                debug!(
                    target: LOG_TARGET,
                    email,
                    error = %err,
                    "MX resolution failed"
                );
                return Verdict {
                    email: email.to_string(),
                    domain: address.domain,
                    mx: None,
                    status: Status::Invalid,
                    reason: "No MX records found".to_string(),
                    details: VerdictDetails::default(),
                };
            }
        };

        let Some(record) = resolution.records.first() else {
            return Verdict {
                email: email.to_string(),
                domain: address.domain,
                mx: None,
                status: Status::Unknown,
                reason: "Resolver returned no exchangers".to_string(),
                details: VerdictDetails::default(),
            };
        };
        let exchange = record.exchange.clone();
        debug!(
            target: LOG_TARGET,
            email,
            mx = %exchange,
            tier = resolution.tier,
            "probing exchanger"
        );

        match self.probe(&address, &exchange) {
            Ok(outcome) => synthesize(email, &address.domain, &exchange, &outcome),
            Err(err) => failure_verdict(email, &address.domain, &exchange, &err),
        }
    }

    /// Open a session to `exchange` and run the conversation. The session
    /// is always quit and its socket released, success or not.
    fn probe(&self, address: &Address, exchange: &str) -> Result<ProbeOutcome, ProbeError> {
        let connection = smtp::connect(exchange, self.config.smtp_port, &self.config)?;
        let mut session = SmtpSession::new(connection, &self.config);
        let sender = self.config.sender_for(&address.domain);
        let outcome = run_conversation(&mut session, address, &self.config.helo_name, &sender);
        session.quit();
        outcome
    }
}

/// The two replies the verdict is synthesized from.
#[derive(Debug)]
struct ProbeOutcome {
    probe_reply: SmtpResponse,
    target_reply: SmtpResponse,
}

#[derive(Debug, Error)]
enum ProbeError {
    #[error(transparent)]
    Connect(#[from] smtp::ConnectError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("MAIL FROM rejected: {} {}", .0.code, .0.message)]
    MailFromRejected(SmtpResponse),
}

fn run_conversation<S: SessionStream>(
    session: &mut SmtpSession<S>,
    address: &Address,
    helo_name: &str,
    sender: &str,
) -> Result<ProbeOutcome, ProbeError> {
    session.hello(helo_name)?;
    let mail_reply = session.mail_from(sender)?;
    if !mail_reply.is_success() {
        return Err(ProbeError::MailFromRejected(mail_reply));
    }

    // catch-all probe first, target second
    let probe_rcpt = format!("verify-{}@{}", probe_token(), address.domain);
    let probe_reply = session.rcpt_to(&probe_rcpt)?;
    let target_reply = session.rcpt_to(&address.to_string())?;
    Ok(ProbeOutcome {
        probe_reply,
        target_reply,
    })
}

/// Twelve random hex characters for the probe's local part.
fn probe_token() -> String {
    let bits: u64 = rand::thread_rng().gen_range(0..(1u64 << 48));
    format!("{bits:012x}")
}

fn synthesize(email: &str, domain: &str, exchange: &str, outcome: &ProbeOutcome) -> Verdict {
    let probe = &outcome.probe_reply;
    let target = &outcome.target_reply;

    let details = VerdictDetails {
        smtp_code: Some(target.code),
        smtp_message: Some(target.message.clone()),
        catch_all_active: probe.is_success(),
        greylisted: probe.is_transient() || target.is_transient(),
    };

    let (status, reason) = if probe.is_transient() || target.is_transient() {
        (Status::Unknown, "Greylisted".to_string())
    } else if target.is_permanent() {
        (Status::Invalid, "Recipient rejected".to_string())
    } else if target.is_success() && probe.is_success() {
        (Status::CatchAll, "Domain is Catch-All".to_string())
    } else if target.is_success() {
        (Status::Valid, "Recipient accepted".to_string())
    } else {
        (
            Status::Unknown,
            format!("Unexpected RCPT TO reply: {} {}", target.code, target.message),
        )
    };

    Verdict {
        email: email.to_string(),
        domain: domain.to_string(),
        mx: Some(exchange.to_string()),
        status,
        reason,
        details,
    }
}

fn failure_verdict(email: &str, domain: &str, exchange: &str, err: &ProbeError) -> Verdict {
    let mut details = VerdictDetails::default();
    match err {
        ProbeError::Session(SessionError::HandshakeFailed { code, message }) => {
            details.smtp_code = Some(*code);
            details.smtp_message = Some(message.clone());
        }
        ProbeError::MailFromRejected(reply) => {
            details.smtp_code = Some(reply.code);
            details.smtp_message = Some(reply.message.clone());
            details.greylisted = reply.is_transient();
        }
        _ => {}
    }
    debug!(target: LOG_TARGET, email, error = %err, "verification failed");
    Verdict {
        email: email.to_string(),
        domain: domain.to_string(),
        mx: Some(exchange.to_string()),
        status: Status::Unknown,
        reason: err.to_string(),
        details,
    }
}
