//! The SMTP command state machine.
//!
//! A session owns exactly one stream and a read buffer that survives
//! between commands: each read appends, the whole buffer is re-parsed,
//! and only a complete parse consumes it. Commands are issued strictly
//! in sequence; anything out of order fails before touching the socket.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::trace;

use crate::config::{JitterBands, VerifierConfig};
use crate::LOG_TARGET;

use super::connection::{self, Connection};
use super::error::SessionError;
use super::response::{parse_response, ParseOutcome, SmtpResponse};

const READ_CHUNK: usize = 512;

/// Position in the linear command sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    HelloSent,
    MailFromSent,
    RcptToSent,
    QuitSent,
}

/// The transport seam the session drives. `TcpStream` is the production
/// implementation; tests substitute scripted in-memory streams.
pub trait SessionStream: Read + Write {
    /// Bound the next blocking read. The default is a no-op for streams
    /// that cannot block.
    fn set_read_deadline(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        let _ = timeout;
        Ok(())
    }

    /// Release the transport, politely when the stream supports it.
    fn finish(self)
    where
        Self: Sized,
    {
    }
}

impl SessionStream for TcpStream {
    fn set_read_deadline(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.set_read_timeout(timeout)
    }

    fn finish(self) {
        connection::close_gracefully(self);
    }
}

/// One SMTP conversation over one exclusively owned stream.
pub struct SmtpSession<S: SessionStream> {
    stream: Option<S>,
    state: SessionState,
    buffer: String,
    features: Vec<String>,
    command_timeout: Duration,
    expires_at: Instant,
    jitter: JitterBands,
}

impl SmtpSession<TcpStream> {
    /// Take over an established connection. The socket is released on
    /// [`quit`](Self::quit) or drop, whichever comes first.
    pub fn new(connection: Connection, config: &VerifierConfig) -> Self {
        Self::with_stream(
            connection.stream,
            connection.expires_at,
            config.command_timeout,
            config.jitter.clone(),
        )
    }
}

impl<S: SessionStream> SmtpSession<S> {
    pub(crate) fn with_stream(
        stream: S,
        expires_at: Instant,
        command_timeout: Duration,
        jitter: JitterBands,
    ) -> Self {
        Self {
            stream: Some(stream),
            state: SessionState::Connected,
            buffer: String::new(),
            features: Vec::new(),
            command_timeout,
            expires_at,
            jitter,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    #[cfg(test)]
    pub(crate) fn into_stream(mut self) -> Option<S> {
        self.stream.take()
    }

    /// ESMTP keywords the server advertised in its EHLO reply.
    pub fn features(&self) -> &[String] {
        &self.features
    }

    /// `EHLO`, falling back to `HELO` when the server does not know the
    /// command (500/501/502). Any other non-2xx reply fails the session.
    pub fn hello(&mut self, helo_name: &str) -> Result<SmtpResponse, SessionError> {
        self.expect_state(SessionState::Connected, "EHLO")?;
        let ehlo = self.jitter.ehlo;
        let mut reply = self.exchange("EHLO", format!("EHLO {helo_name}"), ehlo)?;
        if matches!(reply.code, 500 | 501 | 502) {
            let helo = self.jitter.helo;
            reply = self.exchange("HELO", format!("HELO {helo_name}"), helo)?;
        }
        if !reply.is_success() {
            return Err(SessionError::HandshakeFailed {
                code: reply.code,
                message: reply.message,
            });
        }
        self.features = reply
            .lines
            .iter()
            .skip(1)
            .filter_map(|line| line.get(4..))
            .map(|feature| feature.trim().to_string())
            .filter(|feature| !feature.is_empty())
            .collect();
        self.state = SessionState::HelloSent;
        Ok(reply)
    }

    /// `MAIL FROM:<sender>`; angle brackets are literal wire syntax.
    pub fn mail_from(&mut self, sender: &str) -> Result<SmtpResponse, SessionError> {
        self.expect_state(SessionState::HelloSent, "MAIL FROM")?;
        let band = self.jitter.mail_from;
        let reply = self.exchange("MAIL FROM", format!("MAIL FROM:<{sender}>"), band)?;
        self.state = SessionState::MailFromSent;
        Ok(reply)
    }

    /// `RCPT TO:<recipient>`. May be repeated: the catch-all probe and the
    /// target recipient share one envelope.
    pub fn rcpt_to(&mut self, recipient: &str) -> Result<SmtpResponse, SessionError> {
        if !matches!(
            self.state,
            SessionState::MailFromSent | SessionState::RcptToSent
        ) {
            return Err(SessionError::ProtocolViolation {
                state: self.state,
                command: "RCPT TO",
            });
        }
        let band = self.jitter.rcpt_to;
        let reply = self.exchange("RCPT TO", format!("RCPT TO:<{recipient}>"), band)?;
        self.state = SessionState::RcptToSent;
        Ok(reply)
    }

    /// Best-effort `QUIT`. Write errors are swallowed, the 221 reply is
    /// not awaited, and the stream is always released.
    pub fn quit(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.write_all(b"QUIT\r\n");
            let _ = stream.flush();
            self.state = SessionState::QuitSent;
            stream.finish();
        }
        self.state = SessionState::Disconnected;
    }

    fn expect_state(
        &self,
        expected: SessionState,
        command: &'static str,
    ) -> Result<(), SessionError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(SessionError::ProtocolViolation {
                state: self.state,
                command,
            })
        }
    }

    fn exchange(
        &mut self,
        label: &'static str,
        command: String,
        band: (u64, u64),
    ) -> Result<SmtpResponse, SessionError> {
        let state = self.state;
        let Self {
            stream,
            buffer,
            command_timeout,
            expires_at,
            ..
        } = self;
        let stream = stream.as_mut().ok_or(SessionError::ProtocolViolation {
            state,
            command: label,
        })?;

        pause_for(band);
        trace!(target: LOG_TARGET, command = label, "sending command");
        write_command(stream, &command)?;
        read_framed(stream, buffer, *command_timeout, *expires_at)
    }
}

impl<S: SessionStream> Drop for SmtpSession<S> {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.finish();
        }
    }
}

fn write_command<S: SessionStream>(stream: &mut S, command: &str) -> Result<(), SessionError> {
    let mut line = Vec::with_capacity(command.len() + 2);
    line.extend_from_slice(command.as_bytes());
    line.extend_from_slice(b"\r\n");
    stream.write_all(&line).map_err(map_io)?;
    stream.flush().map_err(map_io)
}

/// Append chunks to the session buffer until the parser frames a complete
/// reply, then consume the buffer. Each read is bounded by the command
/// timeout clamped to what remains of the session lifetime.
fn read_framed<S: SessionStream>(
    stream: &mut S,
    buffer: &mut String,
    command_timeout: Duration,
    expires_at: Instant,
) -> Result<SmtpResponse, SessionError> {
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        if let ParseOutcome::Complete(response) = parse_response(buffer) {
            buffer.clear();
            return Ok(response);
        }

        let remaining = expires_at
            .checked_duration_since(Instant::now())
            .filter(|left| !left.is_zero())
            .ok_or(SessionError::Timeout)?;
        stream
            .set_read_deadline(Some(command_timeout.min(remaining)))
            .map_err(map_io)?;
        match stream.read(&mut chunk) {
            Ok(0) => return Err(SessionError::EmptyResponse),
            Ok(read) => buffer.push_str(&String::from_utf8_lossy(&chunk[..read])),
            Err(err) if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                return Err(SessionError::Timeout)
            }
            Err(err) => return Err(SessionError::Io(err)),
        }
    }
}

fn map_io(err: io::Error) -> SessionError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => SessionError::Timeout,
        _ => SessionError::Io(err),
    }
}

/// Sleep a uniformly random duration inside the band (milliseconds).
fn pause_for(band: (u64, u64)) {
    let (min, max) = band;
    let millis = if min >= max {
        min
    } else {
        rand::thread_rng().gen_range(min..=max)
    };
    if millis > 0 {
        thread::sleep(Duration::from_millis(millis));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Feeds pre-scripted chunks to the session and records every byte it
    /// writes. `Ok(0)` once the script runs out.
    struct ScriptedStream {
        replies: VecDeque<Vec<u8>>,
        written: Vec<u8>,
    }

    impl ScriptedStream {
        fn new(replies: &[&str]) -> Self {
            Self {
                replies: replies.iter().map(|chunk| chunk.as_bytes().to_vec()).collect(),
                written: Vec::new(),
            }
        }

        fn written_text(&self) -> String {
            String::from_utf8_lossy(&self.written).to_string()
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.replies.pop_front() {
                Some(chunk) => {
                    let len = chunk.len().min(buf.len());
                    buf[..len].copy_from_slice(&chunk[..len]);
                    if len < chunk.len() {
                        self.replies.push_front(chunk[len..].to_vec());
                    }
                    Ok(len)
                }
                None => Ok(0),
            }
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SessionStream for ScriptedStream {}

    fn session(replies: &[&str]) -> SmtpSession<ScriptedStream> {
        SmtpSession::with_stream(
            ScriptedStream::new(replies),
            Instant::now() + Duration::from_secs(30),
            Duration::from_secs(5),
            JitterBands::none(),
        )
    }

    fn written(session: &SmtpSession<ScriptedStream>) -> String {
        session
            .stream
            .as_ref()
            .map(ScriptedStream::written_text)
            .unwrap_or_default()
    }

    #[test]
    fn ehlo_success_records_features() {
        let mut session = session(&[
            "250-mx.example.com at your service\r\n250-SIZE 35882577\r\n250 PIPELINING\r\n",
        ]);
        let reply = session.hello("verify.example.com").expect("hello");
        assert_eq!(reply.code, 250);
        assert_eq!(session.state(), SessionState::HelloSent);
        assert_eq!(session.features(), ["SIZE 35882577", "PIPELINING"]);
        assert_eq!(written(&session), "EHLO verify.example.com\r\n");
    }

    #[test]
    fn ehlo_unknown_command_falls_back_to_helo() {
        let mut session = session(&[
            "502 5.5.1 command not implemented\r\n",
            "250 mx.example.com\r\n",
        ]);
        let reply = session.hello("verify.example.com").expect("hello");
        assert_eq!(reply.code, 250);
        assert_eq!(session.state(), SessionState::HelloSent);
        let wire = written(&session);
        assert!(wire.contains("EHLO verify.example.com\r\n"));
        assert!(wire.ends_with("HELO verify.example.com\r\n"));
    }

    #[test]
    fn hello_rejection_is_handshake_failure() {
        let mut session = session(&["550 go away\r\n"]);
        let err = session.hello("verify.example.com").expect_err("rejected");
        assert!(matches!(err, SessionError::HandshakeFailed { code: 550, .. }));
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn reply_split_across_chunks_is_accumulated() {
        let mut session = session(&[
            "250-mx.example.com at your servi",
            "ce\r\n250-SIZE 35882577\r\n",
            "250 CHUNKING\r\n",
        ]);
        let reply = session.hello("verify.example.com").expect("hello");
        assert_eq!(reply.lines.len(), 3);
    }

    #[test]
    fn commands_out_of_order_fail_without_writing() {
        let mut session = session(&[]);
        let err = session.rcpt_to("user@example.com").expect_err("violation");
        assert!(matches!(
            err,
            SessionError::ProtocolViolation {
                state: SessionState::Connected,
                command: "RCPT TO",
            }
        ));
        assert_eq!(written(&session), "", "violation must not touch the socket");

        let err = session.mail_from("verify@example.com").expect_err("violation");
        assert!(matches!(err, SessionError::ProtocolViolation { .. }));
        assert_eq!(written(&session), "");
    }

    #[test]
    fn full_conversation_walks_the_states() {
        let mut session = session(&[
            "250 mx.example.com\r\n",
            "250 2.1.0 sender ok\r\n",
            "250 2.1.5 probe ok\r\n",
            "250 2.1.5 target ok\r\n",
        ]);
        session.hello("verify.example.com").expect("hello");
        session.mail_from("verify@example.com").expect("mail from");
        assert_eq!(session.state(), SessionState::MailFromSent);
        session.rcpt_to("verify-a1b2c3d4e5f6@example.com").expect("probe");
        assert_eq!(session.state(), SessionState::RcptToSent);
        // the self-loop: a second recipient on the same envelope
        session.rcpt_to("user@example.com").expect("target");
        assert_eq!(session.state(), SessionState::RcptToSent);

        let wire = written(&session);
        let order = [
            wire.find("EHLO").expect("EHLO"),
            wire.find("MAIL FROM:<verify@example.com>").expect("MAIL FROM"),
            wire.find("RCPT TO:<verify-a1b2c3d4e5f6@example.com>").expect("probe"),
            wire.find("RCPT TO:<user@example.com>").expect("target"),
        ];
        assert!(order.windows(2).all(|pair| pair[0] < pair[1]));

        session.quit();
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn quit_releases_the_stream_and_blocks_further_commands() {
        let mut session = session(&["250 mx.example.com\r\n"]);
        session.hello("verify.example.com").expect("hello");
        session.quit();
        assert_eq!(session.state(), SessionState::Disconnected);
        let err = session.mail_from("verify@example.com").expect_err("closed");
        assert!(matches!(err, SessionError::ProtocolViolation { .. }));
    }

    #[test]
    fn eof_mid_reply_is_empty_response() {
        let mut session = session(&["250-mx.example.com\r\n"]);
        let err = session.hello("verify.example.com").expect_err("eof");
        assert!(matches!(err, SessionError::EmptyResponse));
    }

    #[test]
    fn double_hello_is_a_violation() {
        let mut session = session(&["250 mx.example.com\r\n"]);
        session.hello("verify.example.com").expect("hello");
        let err = session.hello("verify.example.com").expect_err("violation");
        assert!(matches!(
            err,
            SessionError::ProtocolViolation {
                state: SessionState::HelloSent,
                ..
            }
        ));
    }
}
