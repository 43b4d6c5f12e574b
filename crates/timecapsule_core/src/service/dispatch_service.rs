//! Dispatch scheduler: claims due deliveries and drives provider sends.
//!
//! # Responsibility
//! - Recover crashed attempts, promote due retries and claim due deliveries.
//! - Call channel providers outside any database transaction.
//! - Record every outcome through the version compare-and-swap.
//!
//! # Invariants
//! - A claim is one conditional update; of N concurrent claimers exactly one
//!   moves the row to `Processing` and performs the send.
//! - Providers only see deliveries that are `Processing` with
//!   `send_started_at` recorded.
//! - A part already marked sent is never sent again on a later attempt.
//! - Terminal failure refunds in the same transaction that records it.
//! - One delivery's storage error never aborts the rest of a tick's batch.

use crate::config::{DispatchConfig, RetryConfig};
use crate::lifecycle::{self, FailureDisposition, LifecycleEvent, TransitionError};
use crate::model::delivery::{Delivery, DeliveryId, DeliveryStatus};
use crate::model::ledger::CreditType;
use crate::provider::{idempotency_key, FailureCode, ProviderRegistry, SendError, SendRequest};
use crate::repo::delivery_repo::{DeliveryRepository, SqliteDeliveryRepository};
use crate::repo::letter_repo::{LetterRepository, SqliteLetterRepository};
use crate::repo::RepoError;
use crate::service::ledger_service::{refund_in, LedgerError};
use crate::time::Clock;
use chrono::{DateTime, Duration, Utc};
use log::{error, info, warn};
use rand::Rng;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Repo(#[from] RepoError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("delivery not found: {0}")]
    NotFound(DeliveryId),
    #[error("delivery {0} is not due for dispatch")]
    NotDue(DeliveryId),
}

impl From<rusqlite::Error> for DispatchError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Repo(value.into())
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;

/// Result of driving one claimed delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent(DeliveryId),
    RetryScheduled {
        delivery_id: DeliveryId,
        retry_at: DateTime<Utc>,
    },
    FailedTerminal {
        delivery_id: DeliveryId,
        reason: String,
    },
    /// Another worker or a user action won the row first.
    Skipped(DeliveryId),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub recovered: usize,
    pub claimed: usize,
    pub sent: usize,
    pub retry_scheduled: usize,
    pub failed_terminal: usize,
    pub skipped: usize,
    /// Claimed deliveries whose attempt hit a storage or ledger error.
    pub errored: usize,
}

impl TickReport {
    fn record(&mut self, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::Sent(_) => self.sent += 1,
            DispatchOutcome::RetryScheduled { .. } => self.retry_scheduled += 1,
            DispatchOutcome::FailedTerminal { .. } => self.failed_terminal += 1,
            DispatchOutcome::Skipped(_) => self.skipped += 1,
        }
    }
}

/// Exponential backoff with symmetric jitter for retry `attempt` (1-based).
pub fn compute_backoff<R: Rng + ?Sized>(retry: &RetryConfig, attempt: u32, rng: &mut R) -> Duration {
    let exponent = attempt.saturating_sub(1).min(32);
    let base_ms = retry.base_delay().num_milliseconds().max(0);
    let max_ms = retry.max_delay().num_milliseconds().max(0);
    let capped = base_ms
        .checked_mul(1_i64 << exponent)
        .map_or(max_ms, |value| value.min(max_ms));

    let ratio = retry.jitter_ratio.clamp(0.0, 0.99);
    if ratio == 0.0 || capped == 0 {
        return Duration::milliseconds(capped);
    }
    let factor = rng.gen_range((1.0 - ratio)..=(1.0 + ratio));
    Duration::milliseconds((capped as f64 * factor).round() as i64)
}

pub struct DispatchScheduler<'conn, C: Clock> {
    conn: &'conn Connection,
    clock: C,
    providers: ProviderRegistry,
    retry: RetryConfig,
    dispatch: DispatchConfig,
}

impl<'conn, C: Clock> DispatchScheduler<'conn, C> {
    pub fn new(
        conn: &'conn Connection,
        clock: C,
        providers: ProviderRegistry,
        retry: RetryConfig,
        dispatch: DispatchConfig,
    ) -> Self {
        Self {
            conn,
            clock,
            providers,
            retry,
            dispatch,
        }
    }

    /// One scheduler pass: recover, promote, claim, execute.
    pub fn run_tick(&self) -> DispatchResult<TickReport> {
        let now = self.clock.now();
        let limit = self.dispatch.batch_limit;
        let repo = SqliteDeliveryRepository::try_new(self.conn)?;
        let mut report = TickReport::default();

        let stale_before = now - self.dispatch.processing_timeout();
        for id in repo.stale_processing(stale_before, limit)? {
            if self.recover_stale(id, stale_before)? {
                report.recovered += 1;
            }
        }
        if report.recovered > self.dispatch.high_volume_warn_threshold as usize {
            warn!(
                "event=dispatch_recover module=dispatch status=high_volume recovered={} threshold={}",
                report.recovered, self.dispatch.high_volume_warn_threshold
            );
        } else if report.recovered > 0 {
            info!(
                "event=dispatch_recover module=dispatch status=ok recovered={}",
                report.recovered
            );
        }

        let mut claimed = Vec::new();
        for id in repo.due_retries(now, limit)? {
            if let Some(delivery) = self.claim(id, &LifecycleEvent::Retry)? {
                claimed.push(delivery);
            } else {
                report.skipped += 1;
            }
        }
        for id in repo.due_scheduled(now, limit)? {
            if let Some(delivery) = self.claim(id, &LifecycleEvent::DispatchTick)? {
                claimed.push(delivery);
            } else {
                report.skipped += 1;
            }
        }

        report.claimed = claimed.len();
        for delivery in claimed {
            let id = delivery.id;
            match self.execute(delivery) {
                Ok(outcome) => report.record(&outcome),
                // Left in `Processing`; stale recovery picks it up on a later tick.
                Err(err) => {
                    report.errored += 1;
                    error!(
                        "event=dispatch_send module=dispatch status=error delivery_id={} error={}",
                        id, err
                    );
                }
            }
        }

        info!(
            "event=dispatch_tick module=dispatch status=ok recovered={} claimed={} sent={} retry={} failed={} skipped={} errored={}",
            report.recovered,
            report.claimed,
            report.sent,
            report.retry_scheduled,
            report.failed_terminal,
            report.skipped,
            report.errored
        );
        Ok(report)
    }

    /// Claims and executes one delivery whose send instant has passed.
    ///
    /// A delivery that already left `Scheduled` is reported as `Skipped`.
    pub fn dispatch_tick(&self, id: DeliveryId) -> DispatchResult<DispatchOutcome> {
        let current = self.load(id)?;
        if current.status != DeliveryStatus::Scheduled {
            return Ok(DispatchOutcome::Skipped(id));
        }
        if !current.send_at.is_some_and(|send_at| send_at <= self.clock.now()) {
            return Err(DispatchError::NotDue(id));
        }

        match self.claim_loaded(&current, &LifecycleEvent::DispatchTick)? {
            Some(processing) => self.execute(processing),
            None => Ok(DispatchOutcome::Skipped(id)),
        }
    }

    /// Retries a parked delivery immediately on the owner's request.
    pub fn retry_now(&self, owner_id: &str, id: DeliveryId) -> DispatchResult<DispatchOutcome> {
        let current = self.load(id)?;
        if current.owner_id != owner_id {
            return Err(DispatchError::NotFound(id));
        }
        match self.claim_loaded(&current, &LifecycleEvent::Retry)? {
            Some(processing) => self.execute(processing),
            None => Ok(DispatchOutcome::Skipped(id)),
        }
    }

    fn load(&self, id: DeliveryId) -> DispatchResult<Delivery> {
        SqliteDeliveryRepository::try_new(self.conn)?
            .get_delivery(id)?
            .ok_or(DispatchError::NotFound(id))
    }

    fn claim(&self, id: DeliveryId, event: &LifecycleEvent) -> DispatchResult<Option<Delivery>> {
        match SqliteDeliveryRepository::try_new(self.conn)?.get_delivery(id)? {
            Some(current) => match self.claim_loaded(&current, event) {
                Err(DispatchError::Transition(_)) => Ok(None),
                other => other,
            },
            None => Ok(None),
        }
    }

    /// Moves `current` into `Processing`; `None` when another writer won.
    fn claim_loaded(
        &self,
        current: &Delivery,
        event: &LifecycleEvent,
    ) -> DispatchResult<Option<Delivery>> {
        let transition = lifecycle::apply(current, event, self.clock.now())?;
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        match SqliteDeliveryRepository::try_new(&tx)?.save_transition(current.version, &transition) {
            Ok(()) => {}
            Err(RepoError::StaleState { .. }) => {
                info!(
                    "event=dispatch_claim module=dispatch status=lost delivery_id={}",
                    current.id
                );
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        }
        tx.commit()?;

        info!(
            "event=dispatch_claim module=dispatch status=ok delivery_id={} attempt={}",
            current.id, transition.next.attempt_count
        );
        Ok(Some(transition.next))
    }

    fn recover_stale(&self, id: DeliveryId, stale_before: DateTime<Utc>) -> DispatchResult<bool> {
        let current = self.load(id)?;
        let stuck = current.status == DeliveryStatus::Processing
            && current
                .processing_started_at
                .is_some_and(|started| started <= stale_before);
        if !stuck {
            return Ok(false);
        }

        let error = SendError::Transient {
            code: FailureCode::StaleProcessing,
            message: "attempt exceeded processing timeout".to_string(),
        };
        let outcome = self.record_failure(&current, &error)?;
        Ok(!matches!(outcome, DispatchOutcome::Skipped(_)))
    }

    fn execute(&self, claimed: Delivery) -> DispatchResult<DispatchOutcome> {
        let id = claimed.id;
        let Some(mut current) = self.advance(&claimed, &LifecycleEvent::SendStarted)? else {
            return Ok(DispatchOutcome::Skipped(id));
        };

        let content_handle = match SqliteLetterRepository::try_new(self.conn)?
            .get_letter(current.letter_id, true)?
        {
            Some(letter) => letter.content_handle,
            None => {
                let error = SendError::Terminal {
                    code: FailureCode::Rejected,
                    message: "letter is missing".to_string(),
                };
                return self.record_failure(&current, &error);
            }
        };

        let attempt = current.attempt_count;
        for &part in current.channel.required_credits() {
            if current.part_sent_at(part).is_some() {
                continue;
            }

            let request = SendRequest {
                delivery_id: id,
                letter_id: current.letter_id,
                part,
                attempt,
                idempotency_key: idempotency_key(id, attempt),
                content_handle: content_handle.clone(),
                recipient_email: match part {
                    CreditType::Email => current.recipient.email.clone(),
                    CreditType::Mail => None,
                },
                recipient_address: match part {
                    CreditType::Email => None,
                    CreditType::Mail => current.recipient.address.clone(),
                },
                scheduled_for: current.send_at.unwrap_or(current.updated_at),
            };

            let sent = match self.providers.get(part) {
                Some(provider) => provider.send(&request),
                None => Err(SendError::Transient {
                    code: FailureCode::ProviderUnavailable,
                    message: format!("no provider registered for {}", part.as_str()),
                }),
            };

            match sent {
                Ok(receipt) => {
                    let event = LifecycleEvent::PartSent {
                        part,
                        provider_ref: Some(receipt.provider_ref),
                    };
                    current = match self.advance(&current, &event)? {
                        Some(next) => next,
                        None => return Ok(DispatchOutcome::Skipped(id)),
                    };
                }
                Err(error) => return self.record_failure(&current, &error),
            }
        }

        match self.advance(&current, &LifecycleEvent::SendSucceeded)? {
            Some(sent) => {
                info!(
                    "event=dispatch_send module=dispatch status=ok delivery_id={} channel={} attempt={}",
                    id,
                    sent.channel.as_str(),
                    sent.attempt_count
                );
                Ok(DispatchOutcome::Sent(id))
            }
            None => Ok(DispatchOutcome::Skipped(id)),
        }
    }

    /// Applies a non-refunding transition; `None` when the row moved on.
    fn advance(&self, current: &Delivery, event: &LifecycleEvent) -> DispatchResult<Option<Delivery>> {
        let transition = lifecycle::apply(current, event, self.clock.now())?;
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        match SqliteDeliveryRepository::try_new(&tx)?.save_transition(current.version, &transition) {
            Ok(()) => {}
            Err(RepoError::StaleState { .. }) => return Ok(None),
            Err(err) => return Err(err.into()),
        }
        tx.commit()?;
        Ok(Some(transition.next))
    }

    fn record_failure(&self, current: &Delivery, error: &SendError) -> DispatchResult<DispatchOutcome> {
        let now = self.clock.now();
        let disposition = if error.is_transient() && current.attempt_count < self.retry.max_attempts {
            let delay = compute_backoff(&self.retry, current.attempt_count, &mut rand::thread_rng());
            FailureDisposition::RetryAt(now + delay)
        } else {
            FailureDisposition::Terminal
        };
        let reason = error.reason();
        let transition = lifecycle::apply(
            current,
            &LifecycleEvent::SendFailed {
                reason: reason.clone(),
                disposition,
            },
            now,
        )?;

        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        match SqliteDeliveryRepository::try_new(&tx)?.save_transition(current.version, &transition) {
            Ok(()) => {}
            Err(RepoError::StaleState { .. }) => return Ok(DispatchOutcome::Skipped(current.id)),
            Err(err) => return Err(err.into()),
        }
        if let Some(refund) = transition.refund {
            refund_in(&tx, current.id, &current.owner_id, refund, now)?;
        }
        tx.commit()?;

        warn!(
            "event=dispatch_send module=dispatch status=failed delivery_id={} attempt={} code={} transient={} next={}",
            current.id,
            current.attempt_count,
            error.code().as_str(),
            error.is_transient(),
            transition.next.status.as_str()
        );
        Ok(match disposition {
            FailureDisposition::RetryAt(retry_at) => DispatchOutcome::RetryScheduled {
                delivery_id: current.id,
                retry_at,
            },
            FailureDisposition::Terminal => DispatchOutcome::FailedTerminal {
                delivery_id: current.id,
                reason,
            },
        })
    }
}
