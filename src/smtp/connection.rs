//! Connection establishment: direct TCP or a SOCKS5 tunnel, banner
//! reception under its own window, and graceful close.
//!
//! The proxy handshake and the banner are budgeted separately so that a
//! broken proxy and a silent mail exchanger produce different errors.

use std::io::{self, Read};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::{ProxyConfig, VerifierConfig};
use crate::LOG_TARGET;

use super::error::ConnectError;
use super::response::{parse_response, ParseOutcome, SmtpResponse};
use super::socks5;

/// How long a closing socket waits for the peer's FIN before being
/// destroyed.
const GRACEFUL_CLOSE_WAIT: Duration = Duration::from_secs(1);
const READ_CHUNK: usize = 512;

/// A connected SMTP peer that has presented a valid `220` banner. The
/// caller owns the socket; [`SmtpSession`](super::SmtpSession) takes it
/// over and guarantees release on every exit path.
#[derive(Debug)]
pub struct Connection {
    pub(crate) stream: TcpStream,
    pub banner: SmtpResponse,
    pub proxy_used: bool,
    /// Hard ceiling on the connection's lifetime, stamped at connect.
    pub(crate) expires_at: Instant,
}

/// Open a ready-to-talk connection to `host:port`, through the configured
/// SOCKS5 proxy when one is present. On failure no socket is leaked.
pub fn connect(host: &str, port: u16, config: &VerifierConfig) -> Result<Connection, ConnectError> {
    let proxy_used = config.proxy.is_some();
    let stream = match &config.proxy {
        Some(proxy) => connect_via_proxy(host, port, proxy, config)?,
        None => connect_direct(host, port, config.connect_timeout)?,
    };
    let expires_at = Instant::now() + config.session_lifetime;

    let banner = match read_banner(&stream, config.banner_timeout) {
        Ok(banner) => banner,
        Err(err) => {
            let _ = stream.shutdown(Shutdown::Both);
            return Err(err);
        }
    };
    if let Err(source) = stream.set_write_timeout(Some(config.command_timeout)) {
        let _ = stream.shutdown(Shutdown::Both);
        return Err(ConnectError::SmtpSocketError { source });
    }
    debug!(
        target: LOG_TARGET,
        host,
        port,
        proxy = proxy_used,
        code = banner.code,
        "SMTP banner received"
    );
    Ok(Connection {
        stream,
        banner,
        proxy_used,
        expires_at,
    })
}

fn connect_direct(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, ConnectError> {
    let addrs: Vec<_> = (host, port)
        .to_socket_addrs()
        .map_err(|err| ConnectError::SmtpConnectionFailed {
            host: host.to_string(),
            port,
            message: "address resolution failed".to_string(),
            rejection: None,
            source: Some(err),
        })?
        .collect();

    let mut last: Option<io::Error> = None;
    for addr in &addrs {
        match TcpStream::connect_timeout(addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) => last = Some(err),
        }
    }
    Err(match last {
        Some(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
            ConnectError::SocketTimeout
        }
        Some(err) => ConnectError::SmtpConnectionFailed {
            host: host.to_string(),
            port,
            message: "connection attempt failed".to_string(),
            rejection: None,
            source: Some(err),
        },
        None => ConnectError::SmtpConnectionFailed {
            host: host.to_string(),
            port,
            message: "no socket addresses resolved".to_string(),
            rejection: None,
            source: None,
        },
    })
}

fn connect_via_proxy(
    host: &str,
    port: u16,
    proxy: &ProxyConfig,
    config: &VerifierConfig,
) -> Result<TcpStream, ConnectError> {
    let deadline = Instant::now() + config.proxy_timeout;
    let addrs: Vec<_> = (proxy.host.as_str(), proxy.port)
        .to_socket_addrs()
        .map_err(|err| ConnectError::ProxyConnectionFailed {
            message: "proxy address resolution failed".to_string(),
            source: Some(err),
        })?
        .collect();

    let mut last: Option<io::Error> = None;
    let mut stream = None;
    for addr in &addrs {
        match TcpStream::connect_timeout(addr, config.connect_timeout) {
            Ok(connected) => {
                stream = Some(connected);
                break;
            }
            Err(err) => last = Some(err),
        }
    }
    let mut stream = stream.ok_or_else(|| match last {
        Some(err)
            if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
        {
            ConnectError::ProxyHandshakeTimeout
        }
        Some(err) => ConnectError::ProxyConnectionFailed {
            message: "connection attempt failed".to_string(),
            source: Some(err),
        },
        None => ConnectError::ProxyConnectionFailed {
            message: "proxy address did not resolve".to_string(),
            source: None,
        },
    })?;

    if let Err(err) = socks5::establish(&mut stream, proxy, host, port, deadline) {
        let _ = stream.shutdown(Shutdown::Both);
        return Err(err);
    }
    debug!(target: LOG_TARGET, proxy = %proxy.host, host, port, "SOCKS5 tunnel established");
    Ok(stream)
}

/// Accumulate bytes until the parser frames the banner, all within the
/// banner window. The first four bytes must read `220 ` or `220-`.
fn read_banner(stream: &TcpStream, timeout: Duration) -> Result<SmtpResponse, ConnectError> {
    let deadline = Instant::now() + timeout;
    let mut reader = stream;
    let mut buffer = String::new();
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .filter(|left| !left.is_zero())
            .ok_or(ConnectError::SmtpBannerTimeout)?;
        stream
            .set_read_timeout(Some(remaining))
            .map_err(|source| ConnectError::SmtpSocketError { source })?;

        let read = match reader.read(&mut chunk) {
            Ok(0) => {
                return Err(ConnectError::SmtpSocketError {
                    source: io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed before the banner",
                    ),
                })
            }
            Ok(read) => read,
            Err(err)
                if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                return Err(ConnectError::SmtpBannerTimeout)
            }
            Err(source) => return Err(ConnectError::SmtpSocketError { source }),
        };
        buffer.push_str(&String::from_utf8_lossy(&chunk[..read]));

        if buffer.len() >= 4 && !buffer.starts_with("220 ") && !buffer.starts_with("220-") {
            return Err(banner_invalid(&buffer));
        }
        if let ParseOutcome::Complete(banner) = parse_response(&buffer) {
            if banner.code != 220 {
                return Err(ConnectError::SmtpBannerInvalid {
                    code: banner.code,
                    banner: banner.message,
                });
            }
            return Ok(banner);
        }
    }
}

fn banner_invalid(buffer: &str) -> ConnectError {
    let first_line = buffer.lines().next().unwrap_or_default();
    let code = first_line
        .get(..3)
        .and_then(|digits| digits.parse::<u16>().ok())
        .unwrap_or(0);
    ConnectError::SmtpBannerInvalid {
        code,
        banner: first_line.to_string(),
    }
}

/// Graceful close: send our FIN, give the peer up to a second to answer
/// with its own, then destroy the socket.
pub(crate) fn close_gracefully(stream: TcpStream) {
    if stream.shutdown(Shutdown::Write).is_err() {
        return;
    }
    if stream.set_read_timeout(Some(GRACEFUL_CLOSE_WAIT)).is_err() {
        return;
    }
    let mut sink = [0u8; READ_CHUNK];
    let mut reader = &stream;
    while matches!(reader.read(&mut sink), Ok(read) if read > 0) {}
}
