//! Outbound send provider contracts.
//!
//! # Responsibility
//! - Define the narrow interface email and physical-mail senders implement.
//! - Carry the per-attempt idempotency key providers use to dedupe.
//!
//! # Invariants
//! - Providers are only invoked while a delivery is `Processing`.
//! - Every provider error is classified as transient or terminal.
//! - Requests never carry letter content, only the opaque content handle.

pub mod classify;
pub mod registry;

use crate::model::delivery::{DeliveryId, MailingAddress};
use crate::model::ledger::CreditType;
use crate::model::letter::LetterId;
use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use classify::{classify_provider_failure, FailureCode};
pub use registry::{ProviderRegistry, ProviderRegistryError};

/// One send call for one channel part of one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendRequest {
    pub delivery_id: DeliveryId,
    pub letter_id: LetterId,
    pub part: CreditType,
    pub attempt: u32,
    pub idempotency_key: String,
    pub content_handle: String,
    pub recipient_email: Option<String>,
    pub recipient_address: Option<MailingAddress>,
    pub scheduled_for: DateTime<Utc>,
}

/// Builds the provider idempotency key for one attempt.
pub fn idempotency_key(delivery_id: DeliveryId, attempt: u32) -> String {
    format!("delivery-{delivery_id}-attempt-{attempt}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    pub provider_ref: String,
    /// Business days quoted by a mail carrier, if any.
    pub transit_days: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("transient send failure ({}): {message}", .code.as_str())]
    Transient { code: FailureCode, message: String },
    #[error("terminal send failure ({}): {message}", .code.as_str())]
    Terminal { code: FailureCode, message: String },
}

impl SendError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn code(&self) -> FailureCode {
        match self {
            Self::Transient { code, .. } | Self::Terminal { code, .. } => *code,
        }
    }

    /// Short persisted reason, e.g. `timeout: upstream took too long`.
    pub fn reason(&self) -> String {
        match self {
            Self::Transient { code, message } | Self::Terminal { code, message } => {
                format!("{}: {message}", code.as_str())
            }
        }
    }
}

/// Adapter for one outbound channel (email or physical mail).
///
/// Implementations translate their vendor's raw failure (HTTP status and
/// message) through [`classify_provider_failure`] so retry behavior stays
/// uniform across vendors. Only failures the vendor cannot express that way
/// should build a [`SendError`] directly.
pub trait SendProvider: Send + Sync {
    fn provider_id(&self) -> &str;
    /// Channel part this provider fulfils.
    fn kind(&self) -> CreditType;
    fn send(&self, request: &SendRequest) -> Result<SendReceipt, SendError>;
    /// Carrier transit quote for a mailing address, when available.
    fn quote_transit_days(&self, _address: &MailingAddress) -> Option<u32> {
        None
    }
}

/// Provider that accepts every addressable request and only logs metadata.
///
/// A request without a destination for its part is refused as a vendor
/// would refuse it, with a 400.
#[derive(Debug, Clone)]
pub struct DryRunProvider {
    provider_id: String,
    kind: CreditType,
}

impl DryRunProvider {
    pub fn new(kind: CreditType) -> Self {
        Self {
            provider_id: format!("dry_run_{}", kind.as_str()),
            kind,
        }
    }
}

impl SendProvider for DryRunProvider {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn kind(&self) -> CreditType {
        self.kind
    }

    fn send(&self, request: &SendRequest) -> Result<SendReceipt, SendError> {
        let addressable = match request.part {
            CreditType::Email => request.recipient_email.is_some(),
            CreditType::Mail => request.recipient_address.is_some(),
        };
        if !addressable {
            let error = classify_provider_failure(
                Some(400),
                &format!("recipient {} address missing", request.part.as_str()),
            );
            warn!(
                "event=provider_send module=provider status=rejected provider={} delivery_id={} code={}",
                self.provider_id,
                request.delivery_id,
                error.code().as_str()
            );
            return Err(error);
        }

        info!(
            "event=provider_send module=provider status=ok provider={} delivery_id={} part={} attempt={}",
            self.provider_id,
            request.delivery_id,
            request.part.as_str(),
            request.attempt
        );
        Ok(SendReceipt {
            provider_ref: request.idempotency_key.clone(),
            transit_days: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{idempotency_key, DryRunProvider, FailureCode, SendError, SendProvider, SendRequest};
    use crate::model::ledger::CreditType;
    use chrono::Utc;
    use uuid::Uuid;

    fn request(part: CreditType) -> SendRequest {
        let delivery_id = Uuid::new_v4();
        SendRequest {
            delivery_id,
            letter_id: Uuid::new_v4(),
            part,
            attempt: 1,
            idempotency_key: idempotency_key(delivery_id, 1),
            content_handle: "content/handle-1".to_string(),
            recipient_email: None,
            recipient_address: None,
            scheduled_for: Utc::now(),
        }
    }

    #[test]
    fn idempotency_key_is_stable_per_attempt() {
        let id = Uuid::parse_str("8a7d4c0e-7d4f-4d5a-9f57-2e3b8f9d1c11").unwrap();
        assert_eq!(
            idempotency_key(id, 2),
            "delivery-8a7d4c0e-7d4f-4d5a-9f57-2e3b8f9d1c11-attempt-2"
        );
    }

    #[test]
    fn reason_prefixes_failure_code() {
        let err = SendError::Transient {
            code: FailureCode::Timeout,
            message: "upstream took too long".to_string(),
        };
        assert!(err.is_transient());
        assert_eq!(err.reason(), "timeout: upstream took too long");
    }

    #[test]
    fn dry_run_refuses_unaddressable_parts_as_terminal() {
        let email = DryRunProvider::new(CreditType::Email);
        let refused = email.send(&request(CreditType::Email)).unwrap_err();
        assert!(!refused.is_transient());
        assert_eq!(refused.code(), FailureCode::InvalidRecipient);
        assert_eq!(
            refused.reason(),
            "invalid_recipient: recipient email address missing"
        );

        let mut addressed = request(CreditType::Email);
        addressed.recipient_email = Some("me@example.com".to_string());
        let receipt = email.send(&addressed).unwrap();
        assert_eq!(receipt.provider_ref, addressed.idempotency_key);

        let mail = DryRunProvider::new(CreditType::Mail);
        assert_eq!(
            mail.send(&request(CreditType::Mail)).unwrap_err().code(),
            FailureCode::InvalidRecipient
        );
    }
}
