use std::fmt;

use serde::Serialize;

/// Final deliverability status for one address.
///
/// `Risky` is part of the public vocabulary for forward compatibility but
/// is currently never assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Valid,
    Invalid,
    CatchAll,
    Unknown,
    Risky,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Valid => "VALID",
            Self::Invalid => "INVALID",
            Self::CatchAll => "CATCH_ALL",
            Self::Unknown => "UNKNOWN",
            Self::Risky => "RISKY",
        };
        f.write_str(label)
    }
}

/// Raw SMTP signals backing a verdict.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerdictDetails {
    /// Reply code from the deepest command the conversation reached.
    pub smtp_code: Option<u16>,
    pub smtp_message: Option<String>,
    /// The random-alias probe was accepted.
    pub catch_all_active: bool,
    /// A 4xx reply suggested greylisting.
    pub greylisted: bool,
}

/// Normalized verdict for one verified address.
#[derive(Debug, Clone, Serialize)]
pub struct Verdict {
    pub email: String,
    pub domain: String,
    /// The exchanger the conversation targeted, when resolution got
    /// that far.
    pub mx: Option<String>,
    pub status: Status,
    pub reason: String,
    pub details: VerdictDetails,
}
