//! Delivery lifecycle state machine.
//!
//! # Responsibility
//! - Define every legal status transition and its field updates.
//! - Tell the caller which ledger refund a transition requires.
//!
//! # Invariants
//! - `apply` is pure: it never reads the clock or storage.
//! - Every successful transition bumps `version` by exactly one.
//! - Transitions out of a terminal status are always rejected.
//! - Refund-bearing transitions clear `credit_debits` on the returned record.

use crate::model::delivery::{Delivery, DeliveryStatus, RequestedLocalTime, TimingMode};
use crate::model::ledger::{CreditType, LedgerReason};
use chrono::{DateTime, Utc};
use thiserror::Error;

/// How a failed send attempt is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Park in `FailedPendingRetry` until the given instant.
    RetryAt(DateTime<Utc>),
    /// Give up and refund.
    Terminal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleDetails {
    pub timing: TimingMode,
    pub requested_local: RequestedLocalTime,
    pub send_at: DateTime<Utc>,
    pub arrive_at: Option<DateTime<Utc>>,
    pub transit_days: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Schedule(ScheduleDetails),
    DispatchTick,
    Retry,
    SendStarted,
    PartSent {
        part: CreditType,
        provider_ref: Option<String>,
    },
    SendSucceeded,
    DeliveryConfirmed {
        delivered_at: DateTime<Utc>,
    },
    SendFailed {
        reason: String,
        disposition: FailureDisposition,
    },
    Cancel,
    Delete,
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Schedule(_) => "schedule",
            Self::DispatchTick => "dispatch_tick",
            Self::Retry => "retry",
            Self::SendStarted => "send_started",
            Self::PartSent { .. } => "part_sent",
            Self::SendSucceeded => "send_succeeded",
            Self::DeliveryConfirmed { .. } => "delivery_confirmed",
            Self::SendFailed { .. } => "send_failed",
            Self::Cancel => "cancel",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("event `{event}` is not allowed from status `{}`", .from.as_str())]
    InvalidTransition {
        from: DeliveryStatus,
        event: &'static str,
    },
}

/// Audit record written alongside the new version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRecord {
    pub from: DeliveryStatus,
    pub to: DeliveryStatus,
    pub event: &'static str,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: Delivery,
    pub record: TransitionRecord,
    /// Ledger reason for the refund this transition owes, if any.
    pub refund: Option<LedgerReason>,
}

/// Computes the record that results from applying `event` at `now`.
pub fn apply(
    current: &Delivery,
    event: &LifecycleEvent,
    now: DateTime<Utc>,
) -> Result<Transition, TransitionError> {
    use DeliveryStatus as S;

    let from = current.status;
    let reject = || TransitionError::InvalidTransition {
        from,
        event: event.name(),
    };

    let mut next = current.clone();
    let mut refund = None;
    let mut detail = None;

    match (from, event) {
        (S::Draft, LifecycleEvent::Schedule(details)) => {
            next.status = S::Scheduled;
            next.timing = Some(details.timing);
            next.requested_local = Some(details.requested_local.clone());
            next.send_at = Some(details.send_at);
            next.arrive_at = details.arrive_at;
            next.transit_days = details.transit_days;
        }
        (S::Scheduled, LifecycleEvent::DispatchTick)
        | (S::FailedPendingRetry, LifecycleEvent::Retry) => {
            next.status = S::Processing;
            next.attempt_count = current.attempt_count.saturating_add(1);
            next.last_attempt_at = Some(now);
            next.processing_started_at = Some(now);
            next.send_started_at = None;
            next.next_retry_at = None;
            detail = Some(format!("attempt={}", next.attempt_count));
        }
        (S::Processing, LifecycleEvent::SendStarted) => {
            if current.send_started_at.is_some() {
                return Err(reject());
            }
            next.send_started_at = Some(now);
        }
        (S::Processing, LifecycleEvent::PartSent { part, provider_ref }) => {
            if !current.channel.required_credits().contains(part) {
                return Err(reject());
            }
            match part {
                CreditType::Email => next.email_sent_at = Some(now),
                CreditType::Mail => next.mail_sent_at = Some(now),
            }
            if let Some(reference) = provider_ref {
                next.provider_ref = Some(match current.provider_ref.as_deref() {
                    Some(existing) if existing != reference => format!("{existing},{reference}"),
                    _ => reference.clone(),
                });
            }
            detail = Some(format!("part={}", part.as_str()));
        }
        (S::Processing, LifecycleEvent::SendSucceeded) => {
            next.status = S::Sent;
            if current.channel.includes_email() && next.email_sent_at.is_none() {
                next.email_sent_at = Some(now);
            }
            if current.channel.includes_mail() && next.mail_sent_at.is_none() {
                next.mail_sent_at = Some(now);
            }
            next.processing_started_at = None;
            next.last_failure_reason = None;
        }
        (S::Sent, LifecycleEvent::DeliveryConfirmed { delivered_at }) => {
            next.status = S::Delivered;
            next.delivered_at = Some(*delivered_at);
        }
        (S::Processing, LifecycleEvent::SendFailed {
            reason,
            disposition,
        }) => {
            next.last_failure_reason = Some(reason.clone());
            next.processing_started_at = None;
            match disposition {
                FailureDisposition::RetryAt(at) => {
                    next.status = S::FailedPendingRetry;
                    next.next_retry_at = Some(*at);
                }
                FailureDisposition::Terminal => {
                    next.status = S::FailedTerminal;
                    next.next_retry_at = None;
                    refund = Some(LedgerReason::Refund);
                }
            }
            detail = Some(reason.clone());
        }
        (S::Scheduled, LifecycleEvent::Cancel) => {
            next.status = S::Canceled;
            next.canceled_at = Some(now);
            refund = Some(LedgerReason::Cancel);
        }
        (S::Processing, LifecycleEvent::Cancel) if current.send_started_at.is_none() => {
            next.status = S::Canceled;
            next.canceled_at = Some(now);
            next.processing_started_at = None;
            refund = Some(LedgerReason::Cancel);
        }
        (S::Draft, LifecycleEvent::Delete) => {
            next.status = S::Deleted;
        }
        (S::Scheduled, LifecycleEvent::Delete) => {
            next.status = S::Deleted;
            refund = Some(LedgerReason::Delete);
        }
        _ => return Err(reject()),
    }

    if refund.is_some() {
        next.credit_debits.clear();
    }
    next.version = current.version + 1;
    next.updated_at = now;

    Ok(Transition {
        record: TransitionRecord {
            from,
            to: next.status,
            event: event.name(),
            detail,
        },
        next,
        refund,
    })
}
