//! Minimal SOCKS5 CONNECT client (RFC 1928) with username/password
//! subnegotiation (RFC 1929), hand-rolled over the blocking stream.
//!
//! Reply codes are decoded into a phase (proxy vs target) so the caller
//! can attribute blame: a ruleset violation is the proxy's doing, a
//! refused connection is the exchanger's.

use std::fmt;
use std::io::{self, Read, Write};
use std::net::{IpAddr, TcpStream};
use std::time::Instant;

use crate::config::ProxyConfig;

use super::error::ConnectError;

const VERSION: u8 = 0x05;
const METHOD_NONE: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const AUTH_VERSION: u8 = 0x01;

/// Which side of the tunnel a rejection blames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksPhase {
    Proxy,
    Target,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksReplyKind {
    GeneralFailure,
    RulesetViolation,
    NetworkUnreachable,
    HostUnreachable,
    ConnectionRefused,
    TtlExpired,
    CommandNotSupported,
    AddressTypeNotSupported,
    NoAuthMethods,
}

impl fmt::Display for SocksReplyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::GeneralFailure => "general SOCKS server failure",
            Self::RulesetViolation => "connection not allowed by ruleset",
            Self::NetworkUnreachable => "network unreachable",
            Self::HostUnreachable => "host unreachable",
            Self::ConnectionRefused => "connection refused",
            Self::TtlExpired => "TTL expired",
            Self::CommandNotSupported => "command not supported",
            Self::AddressTypeNotSupported => "address type not supported",
            Self::NoAuthMethods => "no acceptable authentication methods",
        };
        f.write_str(label)
    }
}

/// A decoded non-zero SOCKS5 reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SocksRejection {
    pub code: u8,
    pub kind: SocksReplyKind,
    pub phase: SocksPhase,
    pub retryable: bool,
}

impl SocksRejection {
    /// Decode a reply code; `None` means success (0x00).
    pub fn from_code(code: u8) -> Option<Self> {
        use SocksPhase::{Proxy, Target};
        use SocksReplyKind::*;
        let (kind, phase, retryable) = match code {
            0x00 => return None,
            0x01 => (GeneralFailure, Proxy, true),
            0x02 => (RulesetViolation, Proxy, false),
            0x03 => (NetworkUnreachable, Target, false),
            0x04 => (HostUnreachable, Target, false),
            0x05 => (ConnectionRefused, Target, false),
            0x06 => (TtlExpired, Target, false),
            0x07 => (CommandNotSupported, Proxy, false),
            0x08 => (AddressTypeNotSupported, Proxy, false),
            0xFF => (NoAuthMethods, Proxy, false),
            _ => (GeneralFailure, Proxy, false),
        };
        Some(Self {
            code,
            kind,
            phase,
            retryable,
        })
    }
}

/// Run the full CONNECT handshake on an already-open stream to the proxy.
/// Every read and write is bounded by `deadline`; on success the stream is
/// a transparent tunnel to `target_host:target_port`.
pub(crate) fn establish(
    stream: &mut TcpStream,
    proxy: &ProxyConfig,
    target_host: &str,
    target_port: u16,
    deadline: Instant,
) -> Result<(), ConnectError> {
    let methods: &[u8] = if proxy.credentials().is_some() {
        &[METHOD_NONE, METHOD_USERPASS]
    } else {
        &[METHOD_NONE]
    };
    let mut greeting = Vec::with_capacity(2 + methods.len());
    greeting.push(VERSION);
    greeting.push(methods.len() as u8);
    greeting.extend_from_slice(methods);
    write_bounded(stream, &greeting, deadline)?;

    let mut selection = [0u8; 2];
    read_bounded(stream, &mut selection, deadline)?;
    if selection[0] != VERSION {
        return Err(ConnectError::ProxyConnectionFailed {
            message: format!("proxy answered with SOCKS version {:#04x}", selection[0]),
            source: None,
        });
    }
    match selection[1] {
        METHOD_NONE => {}
        METHOD_USERPASS => authenticate(stream, proxy, deadline)?,
        METHOD_UNACCEPTABLE => {
            let rejection = SocksRejection::from_code(METHOD_UNACCEPTABLE);
            return Err(ConnectError::ProxyAuthFailed {
                message: "proxy accepted none of the offered authentication methods".to_string(),
                rejection,
            });
        }
        other => {
            return Err(ConnectError::ProxyAuthFailed {
                message: format!("proxy selected unsupported authentication method {other:#04x}"),
                rejection: None,
            });
        }
    }

    let mut request = vec![VERSION, CMD_CONNECT, 0x00];
    match target_host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            request.push(ATYP_IPV4);
            request.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            request.push(ATYP_IPV6);
            request.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            if target_host.len() > 255 {
                return Err(ConnectError::InvalidConfig(format!(
                    "target hostname exceeds 255 bytes: {target_host}"
                )));
            }
            request.push(ATYP_DOMAIN);
            request.push(target_host.len() as u8);
            request.extend_from_slice(target_host.as_bytes());
        }
    }
    request.extend_from_slice(&target_port.to_be_bytes());
    write_bounded(stream, &request, deadline)?;

    let mut head = [0u8; 4];
    read_bounded(stream, &mut head, deadline)?;
    if head[0] != VERSION {
        return Err(ConnectError::ProxyConnectionFailed {
            message: format!("proxy answered CONNECT with version {:#04x}", head[0]),
            source: None,
        });
    }
    if let Some(rejection) = SocksRejection::from_code(head[1]) {
        let message = format!("{} (code {:#04x})", rejection.kind, rejection.code);
        return Err(match rejection.phase {
            SocksPhase::Proxy => ConnectError::ProxyAuthFailed {
                message,
                rejection: Some(rejection),
            },
            SocksPhase::Target => ConnectError::SmtpConnectionFailed {
                host: target_host.to_string(),
                port: target_port,
                message,
                rejection: Some(rejection),
                source: None,
            },
        });
    }

    // drain the bound address the proxy reports
    let addr_len = match head[3] {
        ATYP_IPV4 => 4,
        ATYP_IPV6 => 16,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            read_bounded(stream, &mut len, deadline)?;
            len[0] as usize
        }
        other => {
            return Err(ConnectError::ProxyConnectionFailed {
                message: format!("proxy reported unknown address type {other:#04x}"),
                source: None,
            });
        }
    };
    let mut bound = vec![0u8; addr_len + 2];
    read_bounded(stream, &mut bound, deadline)?;
    Ok(())
}

/// RFC 1929 username/password subnegotiation.
fn authenticate(
    stream: &mut TcpStream,
    proxy: &ProxyConfig,
    deadline: Instant,
) -> Result<(), ConnectError> {
    let Some((user, pass)) = proxy.credentials() else {
        return Err(ConnectError::ProxyAuthFailed {
            message: "proxy requires credentials but none are configured".to_string(),
            rejection: None,
        });
    };
    if user.len() > 255 || pass.len() > 255 {
        return Err(ConnectError::InvalidConfig(
            "proxy credentials exceed 255 bytes".to_string(),
        ));
    }

    let mut request = Vec::with_capacity(3 + user.len() + pass.len());
    request.push(AUTH_VERSION);
    request.push(user.len() as u8);
    request.extend_from_slice(user.as_bytes());
    request.push(pass.len() as u8);
    request.extend_from_slice(pass.as_bytes());
    write_bounded(stream, &request, deadline)?;

    let mut reply = [0u8; 2];
    read_bounded(stream, &mut reply, deadline)?;
    if reply[1] != 0x00 {
        return Err(ConnectError::ProxyAuthFailed {
            message: "proxy rejected the supplied credentials".to_string(),
            rejection: None,
        });
    }
    Ok(())
}

fn write_bounded(
    stream: &mut TcpStream,
    bytes: &[u8],
    deadline: Instant,
) -> Result<(), ConnectError> {
    arm(stream, deadline)?;
    stream.write_all(bytes).map_err(handshake_io)?;
    stream.flush().map_err(handshake_io)
}

fn read_bounded(
    stream: &mut TcpStream,
    buf: &mut [u8],
    deadline: Instant,
) -> Result<(), ConnectError> {
    arm(stream, deadline)?;
    stream.read_exact(buf).map_err(handshake_io)
}

/// Point the socket timeouts at whatever remains of the handshake budget.
fn arm(stream: &TcpStream, deadline: Instant) -> Result<(), ConnectError> {
    let remaining = deadline
        .checked_duration_since(Instant::now())
        .filter(|left| !left.is_zero())
        .ok_or(ConnectError::ProxyHandshakeTimeout)?;
    stream
        .set_read_timeout(Some(remaining))
        .and_then(|()| stream.set_write_timeout(Some(remaining)))
        .map_err(|err| ConnectError::ProxyConnectionFailed {
            message: "could not arm the handshake timeouts".to_string(),
            source: Some(err),
        })
}

fn handshake_io(err: io::Error) -> ConnectError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ConnectError::ProxyHandshakeTimeout,
        _ => ConnectError::ProxyConnectionFailed {
            message: "proxy handshake failed".to_string(),
            source: Some(err),
        },
    }
}
