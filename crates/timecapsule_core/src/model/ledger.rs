//! Credit ledger domain model.
//!
//! # Invariants
//! - Entries are append-only; a balance is the sum of deltas per
//!   `(user_id, credit_type)`.
//! - `delta` is never zero.

use crate::model::delivery::DeliveryId;
use crate::model::letter::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type LedgerEntryId = Uuid;

/// Credit bucket funding one delivery channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditType {
    Email,
    Mail,
}

impl CreditType {
    pub const ALL: [CreditType; 2] = [CreditType::Email, CreditType::Mail];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Email => "email",
            Self::Mail => "mail",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "email" => Some(Self::Email),
            "mail" => Some(Self::Mail),
            _ => None,
        }
    }
}

/// Why a ledger entry was written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerReason {
    /// Debit funding a newly scheduled delivery.
    Schedule,
    /// Refund after user cancellation.
    Cancel,
    /// Refund after terminal delivery failure.
    Refund,
    /// Credits granted by the payment collaborator.
    Purchase,
    /// Refund after the delivery or its letter was deleted.
    Delete,
}

impl LedgerReason {
    /// Reasons that credit a delivery's debits back.
    pub fn is_refund(self) -> bool {
        matches!(self, Self::Cancel | Self::Refund | Self::Delete)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Schedule => "schedule",
            Self::Cancel => "cancel",
            Self::Refund => "refund",
            Self::Purchase => "purchase",
            Self::Delete => "delete",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "schedule" => Some(Self::Schedule),
            "cancel" => Some(Self::Cancel),
            "refund" => Some(Self::Refund),
            "purchase" => Some(Self::Purchase),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    pub user_id: UserId,
    pub credit_type: CreditType,
    pub delta: i64,
    pub reason: LedgerReason,
    pub related_delivery_id: Option<DeliveryId>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Exact record of which ledger entry funded a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditDebit {
    pub credit_type: CreditType,
    pub amount: i64,
    pub ledger_entry_id: LedgerEntryId,
}

/// Per-user balances for every credit type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditBalances {
    pub email: i64,
    pub mail: i64,
}

impl CreditBalances {
    pub fn get(&self, credit_type: CreditType) -> i64 {
        match credit_type {
            CreditType::Email => self.email,
            CreditType::Mail => self.mail,
        }
    }

    pub fn set(&mut self, credit_type: CreditType, value: i64) {
        match credit_type {
            CreditType::Email => self.email = value,
            CreditType::Mail => self.mail = value,
        }
    }
}
