//! Maps raw provider failures onto retry semantics.
//!
//! Rules, first match wins:
//! - payload size rejections are terminal
//! - network errors, rate limits (429), timeouts (408/504) and any 5xx are transient
//! - remaining 4xx are terminal
//! - anything unrecognized is transient

use crate::provider::SendError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCode {
    Network,
    RateLimited,
    Timeout,
    ProviderUnavailable,
    PayloadTooLarge,
    InvalidRecipient,
    Rejected,
    StaleProcessing,
    Unknown,
}

impl FailureCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::ProviderUnavailable => "provider_unavailable",
            Self::PayloadTooLarge => "payload_too_large",
            Self::InvalidRecipient => "invalid_recipient",
            Self::Rejected => "rejected",
            Self::StaleProcessing => "stale_processing",
            Self::Unknown => "unknown",
        }
    }
}

/// Classifies a provider failure from its HTTP status (if any) and message.
pub fn classify_provider_failure(status: Option<u16>, message: &str) -> SendError {
    let lowered = message.to_ascii_lowercase();
    let transient = |code| SendError::Transient {
        code,
        message: message.to_string(),
    };
    let terminal = |code| SendError::Terminal {
        code,
        message: message.to_string(),
    };

    if status == Some(413) || lowered.contains("too large") {
        return terminal(FailureCode::PayloadTooLarge);
    }
    if ["econnrefused", "enotfound", "econnreset", "network"]
        .iter()
        .any(|needle| lowered.contains(needle))
    {
        return transient(FailureCode::Network);
    }
    if status == Some(429) || lowered.contains("rate limit") {
        return transient(FailureCode::RateLimited);
    }
    if matches!(status, Some(408) | Some(504))
        || lowered.contains("timeout")
        || lowered.contains("etimedout")
    {
        return transient(FailureCode::Timeout);
    }

    match status {
        Some(code) if (500..600).contains(&code) => transient(FailureCode::ProviderUnavailable),
        Some(400) if lowered.contains("email") || lowered.contains("address") => {
            terminal(FailureCode::InvalidRecipient)
        }
        Some(code) if (400..500).contains(&code) => terminal(FailureCode::Rejected),
        _ => transient(FailureCode::Unknown),
    }
}

#[cfg(test)]
mod tests {
    use super::{classify_provider_failure, FailureCode};

    #[test]
    fn server_and_throttle_errors_are_transient() {
        for status in [408, 429, 500, 502, 503, 504] {
            let err = classify_provider_failure(Some(status), "upstream failed");
            assert!(err.is_transient(), "status {status} should be transient");
        }
        assert_eq!(
            classify_provider_failure(None, "connect ECONNREFUSED 10.0.0.1").code(),
            FailureCode::Network
        );
    }

    #[test]
    fn client_errors_are_terminal() {
        let invalid = classify_provider_failure(Some(400), "invalid email address");
        assert!(!invalid.is_transient());
        assert_eq!(invalid.code(), FailureCode::InvalidRecipient);

        let rejected = classify_provider_failure(Some(403), "sender blocked");
        assert_eq!(rejected.code(), FailureCode::Rejected);

        let too_large = classify_provider_failure(Some(422), "HTML body too large");
        assert_eq!(too_large.code(), FailureCode::PayloadTooLarge);
    }

    #[test]
    fn unknown_failures_default_to_transient() {
        let err = classify_provider_failure(None, "something odd happened");
        assert!(err.is_transient());
        assert_eq!(err.code(), FailureCode::Unknown);
    }
}
