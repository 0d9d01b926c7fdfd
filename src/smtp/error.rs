use thiserror::Error;

use super::session::SessionState;
use super::socks5::SocksRejection;

/// Failure to produce a ready SMTP connection. Each variant names the
/// phase the blame falls on, so a misconfigured proxy never masquerades
/// as a broken mail exchanger.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("invalid connection configuration: {0}")]
    InvalidConfig(String),
    #[error("proxy refused the session: {message}")]
    ProxyAuthFailed {
        message: String,
        rejection: Option<SocksRejection>,
    },
    #[error("proxy handshake timed out")]
    ProxyHandshakeTimeout,
    #[error("could not reach the proxy: {message}")]
    ProxyConnectionFailed {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },
    #[error("connection to {host}:{port} failed: {message}")]
    SmtpConnectionFailed {
        host: String,
        port: u16,
        message: String,
        rejection: Option<SocksRejection>,
        #[source]
        source: Option<std::io::Error>,
    },
    #[error("socket error: {source}")]
    SmtpSocketError {
        #[source]
        source: std::io::Error,
    },
    #[error("timed out connecting to the server")]
    SocketTimeout,
    #[error("no banner received within the banner window")]
    SmtpBannerTimeout,
    #[error("unexpected banner ({code}): {banner}")]
    SmtpBannerInvalid { code: u16, banner: String },
}

impl ConnectError {
    /// The decoded SOCKS5 rejection, when the proxy handshake produced one.
    pub fn socks_rejection(&self) -> Option<&SocksRejection> {
        match self {
            Self::ProxyAuthFailed { rejection, .. }
            | Self::SmtpConnectionFailed { rejection, .. } => rejection.as_ref(),
            _ => None,
        }
    }
}

/// Failure inside an established SMTP session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The command is illegal in the current state; nothing was written.
    #[error("{command} not allowed in state {state:?}")]
    ProtocolViolation {
        state: SessionState,
        command: &'static str,
    },
    /// The server rejected both EHLO and the HELO fallback.
    #[error("server rejected the hello: {code} {message}")]
    HandshakeFailed { code: u16, message: String },
    #[error("server closed the connection without a complete reply")]
    EmptyResponse,
    #[error("timed out waiting for a reply")]
    Timeout,
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),
}
