//! Delivery scheduling and lifecycle use-case service.
//!
//! # Responsibility
//! - Turn a local delivery intent into a funded `Scheduled` delivery.
//! - Apply user-driven transitions (cancel, delete) and carrier callbacks.
//!
//! # Invariants
//! - Resolver and policy errors are returned before any write.
//! - Scheduling writes the delivery, the debit(s) and the letter seal in one
//!   immediate transaction; any failure leaves no trace.
//! - User-facing writes retry once on `StaleState` and then surface
//!   `Conflict`.

use crate::lifecycle::{self, LifecycleEvent, ScheduleDetails, Transition, TransitionError};
use crate::model::delivery::{
    Channel, Delivery, DeliveryId, DeliveryStatus, Recipient, RecipientError, RequestedLocalTime,
    TimingMode,
};
use crate::model::ledger::{CreditDebit, CreditType};
use crate::model::letter::LetterId;
use crate::policy::{MailClass, PolicyEngine, PolicyViolation};
use crate::provider::ProviderRegistry;
use crate::repo::delivery_repo::{
    DeliveryEventRecord, DeliveryListQuery, DeliveryRepository, SqliteDeliveryRepository,
};
use crate::repo::letter_repo::{LetterRepository, SqliteLetterRepository};
use crate::repo::RepoError;
use crate::service::ledger_service::{debit_in, refund_in, DebitRequest, LedgerError};
use crate::service::letter_service::{owned_letter, LetterServiceError};
use crate::time::{Clock, LocalTimeRequest, ResolveError};
use chrono::{DateTime, Utc};
use log::{info, warn};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeliveryServiceError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Policy(#[from] PolicyViolation),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error(transparent)]
    Recipient(#[from] RecipientError),
    #[error("{entity} not found: {id}")]
    NotFound {
        entity: &'static str,
        id: uuid::Uuid,
    },
    #[error("letter {0} is sealed")]
    LetterSealed(LetterId),
    #[error("letter {0} already has an active delivery")]
    ActiveDeliveryExists(LetterId),
    #[error("delivery {0} changed concurrently")]
    StaleState(DeliveryId),
    #[error("delivery {0} kept changing concurrently; retry the request")]
    Conflict(DeliveryId),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Repo(RepoError),
}

impl From<RepoError> for DeliveryServiceError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::NotFound { entity, id } => Self::NotFound { entity, id },
            RepoError::StaleState { id, .. } => Self::StaleState(id),
            RepoError::ActiveDeliveryExists { letter_id } => Self::ActiveDeliveryExists(letter_id),
            other => Self::Repo(other),
        }
    }
}

impl From<rusqlite::Error> for DeliveryServiceError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Repo(value.into())
    }
}

impl From<LetterServiceError> for DeliveryServiceError {
    fn from(value: LetterServiceError) -> Self {
        match value {
            LetterServiceError::NotFound(id) => Self::NotFound {
                entity: "letter",
                id,
            },
            LetterServiceError::LetterSealed(id) => Self::LetterSealed(id),
            LetterServiceError::Repo(err) => err.into(),
        }
    }
}

pub type DeliveryResult<T> = Result<T, DeliveryServiceError>;

/// User intent for scheduling one letter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleRequest {
    pub owner_id: String,
    pub letter_id: LetterId,
    pub channel: Channel,
    pub recipient: Recipient,
    pub timing: TimingMode,
    pub local: LocalTimeRequest,
    /// Defaults to the configured mail class.
    pub mail_class: Option<MailClass>,
    /// Carrier-quoted business days; skips the estimate when present.
    pub transit_days: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ResolvedTiming {
    send_at: DateTime<Utc>,
    arrive_at: Option<DateTime<Utc>>,
    transit_days: Option<u32>,
}

pub struct DeliveryService<'conn, C: Clock> {
    conn: &'conn Connection,
    clock: C,
    policy: PolicyEngine,
    providers: ProviderRegistry,
}

impl<'conn, C: Clock> DeliveryService<'conn, C> {
    pub fn new(conn: &'conn Connection, clock: C, policy: PolicyEngine) -> Self {
        Self {
            conn,
            clock,
            policy,
            providers: ProviderRegistry::new(),
        }
    }

    /// Lets registered mail providers quote transit days.
    pub fn with_providers(mut self, providers: ProviderRegistry) -> Self {
        self.providers = providers;
        self
    }

    /// Creates an unscheduled draft delivery for an editable letter.
    pub fn create_draft(
        &self,
        owner_id: &str,
        letter_id: LetterId,
        channel: Channel,
        recipient: Recipient,
    ) -> DeliveryResult<Delivery> {
        let now = self.clock.now();
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        let letter = owned_letter(&tx, owner_id, letter_id)?;
        if letter.sealed {
            return Err(DeliveryServiceError::LetterSealed(letter_id));
        }

        let delivery = Delivery::new_draft(letter_id, owner_id, channel, recipient, now);
        SqliteDeliveryRepository::try_new(&tx)?.insert_delivery(&delivery, "create_draft")?;
        tx.commit()?;

        info!(
            "event=delivery_draft module=delivery status=ok delivery_id={} channel={}",
            delivery.id,
            channel.as_str()
        );
        Ok(delivery)
    }

    /// Resolves, validates, funds and persists one delivery.
    ///
    /// Promotes the letter's draft delivery when one exists, otherwise creates
    /// the row directly in `Scheduled`.
    pub fn schedule(&self, request: &ScheduleRequest) -> DeliveryResult<Delivery> {
        let now = self.clock.now();
        request.recipient.validate_for(request.channel)?;
        let timing = self.resolve_timing(request, now)?;
        self.policy.scheduling_window(now, timing.send_at)?;

        let details = ScheduleDetails {
            timing: request.timing,
            requested_local: RequestedLocalTime {
                date: request.local.date,
                time: request.local.time,
                zone: request.local.zone.trim().to_string(),
            },
            send_at: timing.send_at,
            arrive_at: timing.arrive_at,
            transit_days: timing.transit_days,
        };

        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        owned_letter(&tx, &request.owner_id, request.letter_id)?;
        let deliveries = SqliteDeliveryRepository::try_new(&tx)?;

        let mut delivery = match deliveries.find_active_for_letter(request.letter_id)? {
            Some(draft) if draft.status == DeliveryStatus::Draft => {
                let mut draft = draft;
                draft.channel = request.channel;
                draft.recipient = request.recipient.clone();
                let transition = lifecycle::apply(&draft, &LifecycleEvent::Schedule(details), now)?;
                deliveries.save_transition(draft.version, &transition)?;
                transition.next
            }
            Some(_) => {
                return Err(DeliveryServiceError::ActiveDeliveryExists(request.letter_id));
            }
            None => {
                let draft = Delivery::new_draft(
                    request.letter_id,
                    request.owner_id.as_str(),
                    request.channel,
                    request.recipient.clone(),
                    now,
                );
                let transition = lifecycle::apply(&draft, &LifecycleEvent::Schedule(details), now)?;
                deliveries.insert_delivery(&transition.next, transition.record.event)?;
                transition.next
            }
        };

        for &credit_type in delivery.channel.required_credits() {
            let entry = debit_in(
                &tx,
                &DebitRequest {
                    user_id: request.owner_id.clone(),
                    credit_type,
                    amount: 1,
                    related_delivery: Some(delivery.id),
                    idempotency_key: Some(format!(
                        "schedule-{}-{}",
                        delivery.id,
                        credit_type.as_str()
                    )),
                },
                now,
            )?;
            delivery.credit_debits.push(CreditDebit {
                credit_type,
                amount: 1,
                ledger_entry_id: entry.id,
            });
        }

        SqliteLetterRepository::try_new(&tx)?.seal_letter(request.letter_id, now)?;
        tx.commit()?;

        info!(
            "event=delivery_schedule module=delivery status=ok delivery_id={} channel={} timing={} send_at={}",
            delivery.id,
            delivery.channel.as_str(),
            request.timing.as_str(),
            timing.send_at.to_rfc3339()
        );
        Ok(delivery)
    }

    /// Cancels a scheduled delivery and refunds its credits.
    pub fn cancel(&self, owner_id: &str, id: DeliveryId) -> DeliveryResult<Delivery> {
        self.with_stale_retry(id, "cancel", || {
            let now = self.clock.now();
            let current = self.owned_delivery(owner_id, id)?;
            if !matches!(
                current.status,
                DeliveryStatus::Scheduled | DeliveryStatus::Processing
            ) {
                return Err(TransitionError::InvalidTransition {
                    from: current.status,
                    event: "cancel",
                }
                .into());
            }
            let send_at = current.send_at.ok_or_else(|| {
                DeliveryServiceError::InvalidRequest("delivery has no send time".to_string())
            })?;
            self.policy.cancellation_cutoff(now, send_at)?;
            let transition = lifecycle::apply(&current, &LifecycleEvent::Cancel, now)?;
            self.commit_transition(&current, transition, now)
        })
    }

    /// Deletes a draft or scheduled delivery; scheduled ones are refunded.
    pub fn delete(&self, owner_id: &str, id: DeliveryId) -> DeliveryResult<Delivery> {
        self.with_stale_retry(id, "delete", || {
            let now = self.clock.now();
            let current = self.owned_delivery(owner_id, id)?;
            let transition = lifecycle::apply(&current, &LifecycleEvent::Delete, now)?;
            self.commit_transition(&current, transition, now)
        })
    }

    /// Soft-deletes a letter and cascades to its active delivery.
    ///
    /// A draft or scheduled delivery becomes `Deleted` (refunded); an
    /// in-flight delivery blocks the delete.
    pub fn delete_letter(&self, owner_id: &str, letter_id: LetterId) -> DeliveryResult<()> {
        let now = self.clock.now();
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        owned_letter(&tx, owner_id, letter_id)?;
        let deliveries = SqliteDeliveryRepository::try_new(&tx)?;

        if let Some(active) = deliveries.find_active_for_letter(letter_id)? {
            match active.status {
                DeliveryStatus::Draft | DeliveryStatus::Scheduled => {
                    let transition = lifecycle::apply(&active, &LifecycleEvent::Delete, now)?;
                    deliveries.save_transition(active.version, &transition)?;
                    if let Some(reason) = transition.refund {
                        refund_in(&tx, active.id, &active.owner_id, reason, now)?;
                    }
                }
                DeliveryStatus::Sent => {}
                other => {
                    return Err(TransitionError::InvalidTransition {
                        from: other,
                        event: "delete",
                    }
                    .into());
                }
            }
        }

        SqliteLetterRepository::try_new(&tx)?.soft_delete_letter(letter_id, now)?;
        tx.commit()?;

        info!(
            "event=letter_delete module=delivery status=ok letter_id={}",
            letter_id
        );
        Ok(())
    }

    /// Records a carrier delivery confirmation.
    pub fn confirm_delivered(
        &self,
        id: DeliveryId,
        delivered_at: DateTime<Utc>,
    ) -> DeliveryResult<Delivery> {
        self.with_stale_retry(id, "delivery_confirmed", || {
            let now = self.clock.now();
            let current = self.load(id)?;
            let transition = lifecycle::apply(
                &current,
                &LifecycleEvent::DeliveryConfirmed { delivered_at },
                now,
            )?;
            self.commit_transition(&current, transition, now)
        })
    }

    pub fn get(&self, owner_id: &str, id: DeliveryId) -> DeliveryResult<Delivery> {
        self.owned_delivery(owner_id, id)
    }

    pub fn list_for_owner(
        &self,
        owner_id: &str,
        query: &DeliveryListQuery,
    ) -> DeliveryResult<Vec<Delivery>> {
        Ok(SqliteDeliveryRepository::try_new(self.conn)?.list_for_owner(owner_id, query)?)
    }

    /// Returns the audit trail of one delivery, oldest first.
    pub fn events(&self, owner_id: &str, id: DeliveryId) -> DeliveryResult<Vec<DeliveryEventRecord>> {
        self.owned_delivery(owner_id, id)?;
        Ok(SqliteDeliveryRepository::try_new(self.conn)?.events_for_delivery(id)?)
    }

    fn resolve_timing(
        &self,
        request: &ScheduleRequest,
        now: DateTime<Utc>,
    ) -> DeliveryResult<ResolvedTiming> {
        let instant = request.local.resolve()?;
        match request.timing {
            TimingMode::SendOn => {
                if !request.channel.includes_mail() {
                    return Ok(ResolvedTiming {
                        send_at: instant,
                        arrive_at: None,
                        transit_days: None,
                    });
                }
                let transit_days = self.transit_days_for(request);
                Ok(ResolvedTiming {
                    send_at: instant,
                    arrive_at: Some(self.policy.compute_arrival_from_send(instant, transit_days)?),
                    transit_days: Some(transit_days),
                })
            }
            TimingMode::ArriveBy => {
                if !request.channel.includes_mail() {
                    return Err(DeliveryServiceError::InvalidRequest(
                        "arrive-by timing requires a physical mail channel".to_string(),
                    ));
                }
                self.policy.arrive_by_advance(now, instant)?;
                let transit_days = self.transit_days_for(request);
                let send_at = self
                    .policy
                    .compute_send_from_arrival(now, instant, transit_days)?;
                Ok(ResolvedTiming {
                    send_at,
                    arrive_at: Some(instant),
                    transit_days: Some(transit_days),
                })
            }
        }
    }

    /// Carrier quote first, then the static transit table.
    fn transit_days_for(&self, request: &ScheduleRequest) -> u32 {
        if let Some(days) = request.transit_days {
            return days;
        }
        let address = request.recipient.address.as_ref();
        if let (Some(provider), Some(address)) = (
            self.providers.get(CreditType::Mail),
            address,
        ) {
            if let Some(days) = provider.quote_transit_days(address) {
                return days;
            }
        }
        let mail_class = request
            .mail_class
            .unwrap_or(self.policy.config().default_mail_class);
        self.policy
            .transit_estimator()
            .estimate(mail_class, address.map(|value| value.country_code.as_str()))
            .total_lead_days()
    }

    fn load(&self, id: DeliveryId) -> DeliveryResult<Delivery> {
        SqliteDeliveryRepository::try_new(self.conn)?
            .get_delivery(id)?
            .ok_or(DeliveryServiceError::NotFound {
                entity: "delivery",
                id,
            })
    }

    fn owned_delivery(&self, owner_id: &str, id: DeliveryId) -> DeliveryResult<Delivery> {
        let delivery = self.load(id)?;
        if delivery.owner_id != owner_id {
            return Err(DeliveryServiceError::NotFound {
                entity: "delivery",
                id,
            });
        }
        Ok(delivery)
    }

    /// Persists a transition computed from `current` and settles its refund.
    fn commit_transition(
        &self,
        current: &Delivery,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> DeliveryResult<Delivery> {
        let tx = Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)?;
        SqliteDeliveryRepository::try_new(&tx)?.save_transition(current.version, &transition)?;
        if let Some(reason) = transition.refund {
            refund_in(&tx, current.id, &current.owner_id, reason, now)?;
        }
        tx.commit()?;

        info!(
            "event=delivery_transition module=delivery status=ok delivery_id={} from={} to={} event={} version={}",
            current.id,
            transition.record.from.as_str(),
            transition.record.to.as_str(),
            transition.record.event,
            transition.next.version
        );
        Ok(transition.next)
    }

    fn with_stale_retry<T>(
        &self,
        id: DeliveryId,
        operation: &'static str,
        mut attempt: impl FnMut() -> DeliveryResult<T>,
    ) -> DeliveryResult<T> {
        match attempt() {
            Err(DeliveryServiceError::StaleState(_)) => {
                warn!(
                    "event=delivery_transition module=delivery status=retry delivery_id={} operation={}",
                    id, operation
                );
                match attempt() {
                    Err(DeliveryServiceError::StaleState(_)) => {
                        Err(DeliveryServiceError::Conflict(id))
                    }
                    other => other,
                }
            }
            other => other,
        }
    }
}
