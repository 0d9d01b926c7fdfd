//! Translation from an internal [`Verdict`] to the public result schema.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

use super::verdict::{Status, Verdict};

static FULL_INBOX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)quota|full|insufficient storage|storage exceeded|limit exceeded")
        .expect("full-inbox pattern is valid")
});

static DISABLED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)disabled|suspended|inactive|deactivated|account closed|not active")
        .expect("disabled-account pattern is valid")
});

/// The five booleans exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PublicResult {
    pub can_connect_smtp: bool,
    pub is_deliverable: bool,
    pub is_catch_all: bool,
    pub has_full_inbox: bool,
    pub is_disabled: bool,
}

impl From<&Verdict> for PublicResult {
    fn from(verdict: &Verdict) -> Self {
        let details = &verdict.details;
        let message = details.smtp_message.as_deref().unwrap_or_default();

        let can_connect_smtp = details.smtp_code.is_some();
        let is_catch_all = verdict.status == Status::CatchAll || details.catch_all_active;
        let has_full_inbox =
            matches!(details.smtp_code, Some(452 | 552 | 554)) && FULL_INBOX.is_match(message);
        let is_disabled = details.smtp_code == Some(550) && DISABLED.is_match(message);
        let is_deliverable = matches!(verdict.status, Status::Valid | Status::CatchAll)
            && !has_full_inbox
            && !is_disabled;

        Self {
            can_connect_smtp,
            is_deliverable,
            is_catch_all,
            has_full_inbox,
            is_disabled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verifier::verdict::VerdictDetails;

    fn verdict(status: Status, code: Option<u16>, message: &str) -> Verdict {
        Verdict {
            email: "user@example.com".to_string(),
            domain: "example.com".to_string(),
            mx: Some("mx.example.com".to_string()),
            status,
            reason: String::new(),
            details: VerdictDetails {
                smtp_code: code,
                smtp_message: code.map(|_| message.to_string()),
                catch_all_active: status == Status::CatchAll,
                greylisted: false,
            },
        }
    }

    #[test]
    fn valid_recipient_is_deliverable() {
        let result = PublicResult::from(&verdict(Status::Valid, Some(250), "2.1.5 OK"));
        assert!(result.can_connect_smtp);
        assert!(result.is_deliverable);
        assert!(!result.is_catch_all);
        assert!(!result.has_full_inbox);
        assert!(!result.is_disabled);
    }

    #[test]
    fn catch_all_is_deliverable_and_flagged() {
        let result = PublicResult::from(&verdict(Status::CatchAll, Some(250), "accepted"));
        assert!(result.is_deliverable);
        assert!(result.is_catch_all);
    }

    #[test]
    fn full_mailbox_overrides_deliverability() {
        let result = PublicResult::from(&verdict(
            Status::Invalid,
            Some(552),
            "Mailbox full",
        ));
        assert!(result.can_connect_smtp);
        assert!(result.has_full_inbox);
        assert!(!result.is_deliverable);
    }

    #[test]
    fn quota_wording_also_counts_as_full() {
        let result = PublicResult::from(&verdict(
            Status::Invalid,
            Some(452),
            "insufficient storage for user",
        ));
        assert!(result.has_full_inbox);
    }

    #[test]
    fn full_wording_on_other_codes_is_ignored() {
        let result = PublicResult::from(&verdict(Status::Invalid, Some(550), "mailbox full"));
        assert!(!result.has_full_inbox);
    }

    #[test]
    fn disabled_account_is_flagged() {
        let result = PublicResult::from(&verdict(
            Status::Invalid,
            Some(550),
            "Account disabled",
        ));
        assert!(result.is_disabled);
        assert!(!result.is_deliverable);
        assert!(result.can_connect_smtp);
    }

    #[test]
    fn disabled_match_is_case_insensitive() {
        let result = PublicResult::from(&verdict(
            Status::Invalid,
            Some(550),
            "5.2.1 mailbox SUSPENDED per policy",
        ));
        assert!(result.is_disabled);
    }

    #[test]
    fn no_code_means_no_connection() {
        let result = PublicResult::from(&verdict(Status::Unknown, None, ""));
        assert!(!result.can_connect_smtp);
        assert!(!result.is_deliverable);
    }
}
