//! Delivery domain model.
//!
//! # Responsibility
//! - Define the scheduling record that moves a letter through its lifecycle.
//! - Own the closed enums for channel, timing mode and status.
//!
//! # Invariants
//! - At most one non-terminal delivery exists per letter.
//! - `credit_debits` is non-empty iff `status.holds_credit()`.
//! - `version` increases by exactly one on every persisted write.
//! - Mail channels carry `arrive_at` and `transit_days`; email-only never does.

use crate::model::ledger::{CreditDebit, CreditType};
use crate::model::letter::{LetterId, UserId};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Stable delivery identifier.
pub type DeliveryId = Uuid;

/// Delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    PhysicalMail,
    Both,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::PhysicalMail => "physical_mail",
            Self::Both => "both",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "email" => Some(Self::Email),
            "physical_mail" | "mail" => Some(Self::PhysicalMail),
            "both" => Some(Self::Both),
            _ => None,
        }
    }

    /// Credit types debited when a delivery on this channel is scheduled.
    pub fn required_credits(self) -> &'static [CreditType] {
        match self {
            Self::Email => &[CreditType::Email],
            Self::PhysicalMail => &[CreditType::Mail],
            Self::Both => &[CreditType::Email, CreditType::Mail],
        }
    }

    pub fn includes_email(self) -> bool {
        matches!(self, Self::Email | Self::Both)
    }

    pub fn includes_mail(self) -> bool {
        matches!(self, Self::PhysicalMail | Self::Both)
    }
}

/// Whether the requested local time names the send instant or the arrival.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimingMode {
    SendOn,
    ArriveBy,
}

impl TimingMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SendOn => "send_on",
            Self::ArriveBy => "arrive_by",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "send_on" => Some(Self::SendOn),
            "arrive_by" => Some(Self::ArriveBy),
            _ => None,
        }
    }
}

/// Lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Draft,
    Scheduled,
    Processing,
    Sent,
    Delivered,
    FailedPendingRetry,
    FailedTerminal,
    Canceled,
    Deleted,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Scheduled => "scheduled",
            Self::Processing => "processing",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::FailedPendingRetry => "failed_retry",
            Self::FailedTerminal => "failed_terminal",
            Self::Canceled => "canceled",
            Self::Deleted => "deleted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "draft" => Some(Self::Draft),
            "scheduled" => Some(Self::Scheduled),
            "processing" => Some(Self::Processing),
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "failed_retry" => Some(Self::FailedPendingRetry),
            "failed_terminal" => Some(Self::FailedTerminal),
            "canceled" => Some(Self::Canceled),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }

    /// No further transition leaves a terminal status.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Delivered | Self::FailedTerminal | Self::Canceled | Self::Deleted
        )
    }

    /// Statuses that keep the delivery's credits debited.
    pub fn holds_credit(self) -> bool {
        matches!(
            self,
            Self::Scheduled
                | Self::Processing
                | Self::Sent
                | Self::Delivered
                | Self::FailedPendingRetry
        )
    }
}

/// Postal address. Only `country_code` is interpreted by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailingAddress {
    pub name: String,
    pub line1: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line2: Option<String>,
    pub city: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub postal_code: String,
    /// ISO 3166-1 alpha-2 code.
    pub country_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub is_self: bool,
    pub email: Option<String>,
    pub address: Option<MailingAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecipientError {
    #[error("email channel requires a recipient email address")]
    MissingEmail,
    #[error("recipient email `{0}` is not a valid address")]
    InvalidEmail(String),
    #[error("physical mail channel requires a mailing address")]
    MissingAddress,
    #[error("mailing address field `{0}` must not be blank")]
    BlankAddressField(&'static str),
}

impl Recipient {
    /// Checks the recipient carries what `channel` needs.
    pub fn validate_for(&self, channel: Channel) -> Result<(), RecipientError> {
        if channel.includes_email() {
            let email = self.email.as_deref().map(str::trim).unwrap_or_default();
            if email.is_empty() {
                return Err(RecipientError::MissingEmail);
            }
            if !looks_like_email(email) {
                return Err(RecipientError::InvalidEmail(email.to_string()));
            }
        }
        if channel.includes_mail() {
            let address = self.address.as_ref().ok_or(RecipientError::MissingAddress)?;
            for (field, value) in [
                ("name", address.name.as_str()),
                ("line1", address.line1.as_str()),
                ("city", address.city.as_str()),
                ("postal_code", address.postal_code.as_str()),
                ("country_code", address.country_code.as_str()),
            ] {
                if value.trim().is_empty() {
                    return Err(RecipientError::BlankAddressField(field));
                }
            }
        }
        Ok(())
    }
}

fn looks_like_email(value: &str) -> bool {
    match value.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.')
        }
        None => false,
    }
}

/// Local wall-clock intent exactly as the user submitted it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestedLocalTime {
    pub date: NaiveDate,
    pub time: NaiveTime,
    pub zone: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub id: DeliveryId,
    pub letter_id: LetterId,
    pub owner_id: UserId,
    pub channel: Channel,
    pub recipient: Recipient,
    pub timing: Option<TimingMode>,
    pub requested_local: Option<RequestedLocalTime>,
    pub send_at: Option<DateTime<Utc>>,
    pub arrive_at: Option<DateTime<Utc>>,
    pub transit_days: Option<u32>,
    pub status: DeliveryStatus,
    pub version: i64,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_failure_reason: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub send_started_at: Option<DateTime<Utc>>,
    pub email_sent_at: Option<DateTime<Utc>>,
    pub mail_sent_at: Option<DateTime<Utc>>,
    pub provider_ref: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub first_opened_at: Option<DateTime<Utc>>,
    pub credit_debits: Vec<CreditDebit>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub canceled_at: Option<DateTime<Utc>>,
}

impl Delivery {
    /// Creates an unscheduled draft delivery.
    pub fn new_draft(
        letter_id: LetterId,
        owner_id: impl Into<UserId>,
        channel: Channel,
        recipient: Recipient,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            letter_id,
            owner_id: owner_id.into(),
            channel,
            recipient,
            timing: None,
            requested_local: None,
            send_at: None,
            arrive_at: None,
            transit_days: None,
            status: DeliveryStatus::Draft,
            version: 0,
            attempt_count: 0,
            last_attempt_at: None,
            last_failure_reason: None,
            next_retry_at: None,
            processing_started_at: None,
            send_started_at: None,
            email_sent_at: None,
            mail_sent_at: None,
            provider_ref: None,
            delivered_at: None,
            first_opened_at: None,
            credit_debits: Vec::new(),
            created_at: now,
            updated_at: now,
            canceled_at: None,
        }
    }

    /// Instant the recipient is considered to have the letter.
    ///
    /// Email-bearing channels reveal at send time; mail-only deliveries use
    /// the confirmed delivery instant, falling back to the planned arrival.
    pub fn effective_instant(&self) -> Option<DateTime<Utc>> {
        if self.channel.includes_email() {
            return self.send_at;
        }
        self.delivered_at.or(self.arrive_at)
    }

    /// Whether every channel part of this delivery has been handed off.
    pub fn all_parts_sent(&self) -> bool {
        (!self.channel.includes_email() || self.email_sent_at.is_some())
            && (!self.channel.includes_mail() || self.mail_sent_at.is_some())
    }

    pub fn part_sent_at(&self, part: CreditType) -> Option<DateTime<Utc>> {
        match part {
            CreditType::Email => self.email_sent_at,
            CreditType::Mail => self.mail_sent_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Channel, Delivery, DeliveryStatus, MailingAddress, Recipient, RecipientError};
    use crate::model::ledger::CreditType;
    use chrono::{Duration, Utc};
    use uuid::Uuid;

    fn address() -> MailingAddress {
        MailingAddress {
            name: "Ada".to_string(),
            line1: "1 Main St".to_string(),
            line2: None,
            city: "Springfield".to_string(),
            region: Some("IL".to_string()),
            postal_code: "62701".to_string(),
            country_code: "US".to_string(),
        }
    }

    #[test]
    fn status_storage_form_is_stable() {
        for status in [
            DeliveryStatus::Draft,
            DeliveryStatus::Scheduled,
            DeliveryStatus::Processing,
            DeliveryStatus::Sent,
            DeliveryStatus::Delivered,
            DeliveryStatus::FailedPendingRetry,
            DeliveryStatus::FailedTerminal,
            DeliveryStatus::Canceled,
            DeliveryStatus::Deleted,
        ] {
            assert_eq!(DeliveryStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn holds_credit_excludes_draft_and_refunded_states() {
        assert!(!DeliveryStatus::Draft.holds_credit());
        assert!(DeliveryStatus::Sent.holds_credit());
        assert!(!DeliveryStatus::Canceled.holds_credit());
        assert!(!DeliveryStatus::FailedTerminal.holds_credit());
    }

    #[test]
    fn both_channel_requires_both_credit_types() {
        assert_eq!(
            Channel::Both.required_credits(),
            &[CreditType::Email, CreditType::Mail]
        );
        assert_eq!(Channel::PhysicalMail.required_credits(), &[CreditType::Mail]);
    }

    #[test]
    fn recipient_validation_follows_channel() {
        let email_only = Recipient {
            is_self: true,
            email: Some("me@example.com".to_string()),
            address: None,
        };
        assert!(email_only.validate_for(Channel::Email).is_ok());
        assert_eq!(
            email_only.validate_for(Channel::Both),
            Err(RecipientError::MissingAddress)
        );

        let bad_email = Recipient {
            is_self: false,
            email: Some("not-an-address".to_string()),
            address: Some(address()),
        };
        assert!(bad_email.validate_for(Channel::PhysicalMail).is_ok());
        assert!(matches!(
            bad_email.validate_for(Channel::Email),
            Err(RecipientError::InvalidEmail(_))
        ));
    }

    #[test]
    fn effective_instant_depends_on_channel() {
        let now = Utc::now();
        let recipient = Recipient {
            is_self: true,
            email: Some("me@example.com".to_string()),
            address: Some(address()),
        };
        let mut delivery =
            Delivery::new_draft(Uuid::new_v4(), "user_1", Channel::PhysicalMail, recipient, now);
        delivery.send_at = Some(now + Duration::days(30));
        delivery.arrive_at = Some(now + Duration::days(37));
        assert_eq!(delivery.effective_instant(), delivery.arrive_at);

        delivery.channel = Channel::Both;
        assert_eq!(delivery.effective_instant(), delivery.send_at);
    }
}
