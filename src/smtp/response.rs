//! SMTP reply framing and classification (RFC 5321 §4.2, RFC 3463).
//!
//! [`parse_response`] is a pure function over an accumulating text buffer:
//! it either frames a complete reply or asks for more bytes. The buffer is
//! never mutated; the caller decides when to drain it.

use std::sync::LazyLock;

use regex::Regex;

/// First match of `code<sep>x.y.z<ws>` anywhere in a line yields the
/// enhanced status code.
static ENHANCED_CODE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\d{3}[ -](\d{1,3}\.\d{1,3}\.\d{1,3})\s").expect("enhanced code pattern is valid")
});

/// Range bucket of a reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    Success,
    Intermediate,
    TransientFail,
    PermanentFail,
    ProtocolError,
}

impl ResponseClass {
    pub fn of(code: u16) -> Self {
        match code {
            200..=299 => Self::Success,
            300..=399 => Self::Intermediate,
            400..=499 => Self::TransientFail,
            500..=599 => Self::PermanentFail,
            _ => Self::ProtocolError,
        }
    }
}

/// A fully framed SMTP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmtpResponse {
    pub code: u16,
    pub enhanced_code: Option<String>,
    pub message: String,
    /// Raw lines as received, prefixes included.
    pub lines: Vec<String>,
    pub classification: ResponseClass,
}

impl SmtpResponse {
    pub fn is_success(&self) -> bool {
        self.classification == ResponseClass::Success
    }

    pub fn is_transient(&self) -> bool {
        self.classification == ResponseClass::TransientFail
    }

    pub fn is_permanent(&self) -> bool {
        self.classification == ResponseClass::PermanentFail
    }
}

/// Outcome of a framing attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome {
    Complete(SmtpResponse),
    /// The buffer ends in a continuation or malformed line; keep reading.
    Incomplete,
}

/// Frame `buffer` into one reply. A reply is complete iff the last
/// non-empty line is `NNN` or `NNN<SP>...`; a `NNN-...` tail means the
/// peer has more lines coming. Malformed tails also read as incomplete;
/// the caller's deadline is the backstop.
pub fn parse_response(buffer: &str) -> ParseOutcome {
    let lines: Vec<&str> = buffer
        .split('\n')
        .map(|line| line.strip_suffix('\r').unwrap_or(line))
        .filter(|line| !line.is_empty())
        .collect();

    let Some(last) = lines.last() else {
        return ParseOutcome::Incomplete;
    };
    if !is_terminal_line(last) {
        return ParseOutcome::Incomplete;
    }
    let Ok(code) = last[..3].parse::<u16>() else {
        return ParseOutcome::Incomplete;
    };

    let enhanced_code = lines.iter().find_map(|line| {
        ENHANCED_CODE
            .captures(line)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    });

    let message = synthesize_message(&lines, enhanced_code.as_deref());

    ParseOutcome::Complete(SmtpResponse {
        code,
        enhanced_code,
        message,
        lines: lines.iter().map(|line| line.to_string()).collect(),
        classification: ResponseClass::of(code),
    })
}

/// Three digits followed by end-of-line or a space.
fn is_terminal_line(line: &str) -> bool {
    let bytes = line.as_bytes();
    bytes.len() >= 3
        && bytes[..3].iter().all(u8::is_ascii_digit)
        && (bytes.len() == 3 || bytes[3] == b' ')
}

/// Strip the `NNN<sep>` prefix from each line, drop the leading enhanced
/// code occurrence, join with single spaces.
fn synthesize_message(lines: &[&str], enhanced: Option<&str>) -> String {
    let mut removed = enhanced.is_none();
    let mut parts = Vec::with_capacity(lines.len());
    for line in lines {
        let mut rest = strip_code_prefix(line);
        if !removed {
            if let Some(code) = enhanced {
                if let Some(tail) = rest.strip_prefix(code) {
                    if tail.is_empty() || tail.starts_with(' ') {
                        rest = tail.trim_start();
                        removed = true;
                    }
                }
            }
        }
        if !rest.is_empty() {
            parts.push(rest);
        }
    }
    // collapse whitespace runs left by the removal
    parts
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn strip_code_prefix(line: &str) -> &str {
    let bytes = line.as_bytes();
    if bytes.len() >= 3 && bytes[..3].iter().all(u8::is_ascii_digit) {
        line.get(4..).unwrap_or("")
    } else {
        // malformed line from a misbehaving peer: keep it verbatim
        line
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete(buffer: &str) -> SmtpResponse {
        match parse_response(buffer) {
            ParseOutcome::Complete(response) => response,
            ParseOutcome::Incomplete => panic!("expected a complete reply for {buffer:?}"),
        }
    }

    #[test]
    fn simple_success() {
        let response = complete("250 OK\r\n");
        assert_eq!(response.code, 250);
        assert_eq!(response.enhanced_code, None);
        assert_eq!(response.message, "OK");
        assert_eq!(response.classification, ResponseClass::Success);
        assert_eq!(response.lines, vec!["250 OK"]);
    }

    #[test]
    fn multi_line_ehlo() {
        let response = complete(
            "250-mx.google.com at your service\r\n250-SIZE 35882577\r\n250-8BITMIME\r\n\
             250-STARTTLS\r\n250-ENHANCEDSTATUSCODES\r\n250 CHUNKING\r\n",
        );
        assert_eq!(response.code, 250);
        assert_eq!(response.lines.len(), 6);
        assert_eq!(response.classification, ResponseClass::Success);
    }

    #[test]
    fn enhanced_code_extracted_and_removed() {
        let response =
            complete("550 5.1.1 The email account that you tried to reach does not exist.\r\n");
        assert_eq!(response.code, 550);
        assert_eq!(response.enhanced_code.as_deref(), Some("5.1.1"));
        assert!(!response.message.contains("5.1.1"));
        assert_eq!(
            response.message,
            "The email account that you tried to reach does not exist."
        );
        assert_eq!(response.classification, ResponseClass::PermanentFail);
    }

    #[test]
    fn continuation_tail_is_incomplete() {
        assert_eq!(
            parse_response("250-mx.google.com at your service\r\n250-SIZE 35882577\r\n"),
            ParseOutcome::Incomplete
        );
    }

    #[test]
    fn empty_and_malformed_buffers_are_incomplete() {
        assert_eq!(parse_response(""), ParseOutcome::Incomplete);
        assert_eq!(parse_response("\r\n\r\n"), ParseOutcome::Incomplete);
        assert_eq!(parse_response("250 OK\r\n2"), ParseOutcome::Incomplete);
        assert_eq!(parse_response("garbage without a code"), ParseOutcome::Incomplete);
        assert_eq!(parse_response("25x nope\r\n"), ParseOutcome::Incomplete);
    }

    #[test]
    fn bare_code_line_completes() {
        let response = complete("250\r\n");
        assert_eq!(response.code, 250);
        assert_eq!(response.message, "");
    }

    #[test]
    fn lf_only_separators_accepted() {
        let response = complete("250-first\n250 last\n");
        assert_eq!(response.lines.len(), 2);
        assert_eq!(response.message, "first last");
    }

    #[test]
    fn enhanced_code_removal_spares_later_occurrences() {
        let response = complete("550 5.1.1 user unknown; consult 5.1.1 docs\r\n");
        assert_eq!(response.enhanced_code.as_deref(), Some("5.1.1"));
        assert_eq!(response.message, "user unknown; consult 5.1.1 docs");
    }

    #[test]
    fn classification_matches_code_bucket() {
        for (code, class) in [
            (250, ResponseClass::Success),
            (354, ResponseClass::Intermediate),
            (451, ResponseClass::TransientFail),
            (550, ResponseClass::PermanentFail),
            (199, ResponseClass::ProtocolError),
            (600, ResponseClass::ProtocolError),
        ] {
            assert_eq!(ResponseClass::of(code), class, "code {code}");
        }

        let response = complete("421 service shutting down\r\n");
        assert_eq!(response.classification, ResponseClass::of(response.code));
    }

    #[test]
    fn reserialized_replies_reparse_identically() {
        for buffer in [
            "250 OK\r\n",
            "250-one\r\n250-two\r\n250 three\r\n",
            "550 5.7.1 rejected by policy\r\n",
            "452 4.2.2 mailbox over quota\r\n",
        ] {
            let first = complete(buffer);
            let rebuilt = first
                .lines
                .iter()
                .map(|line| format!("{line}\r\n"))
                .collect::<String>();
            let second = complete(&rebuilt);
            assert_eq!(first.code, second.code);
            assert_eq!(first.enhanced_code, second.enhanced_code);
            assert_eq!(first.classification, second.classification);
            assert_eq!(first.message, second.message);
        }
    }
}
