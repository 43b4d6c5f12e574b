//! Owner-facing read model.
//!
//! Renders stored UTC instants in the viewer's zone and derives the
//! cancellation window from policy. Never writes.

use crate::model::delivery::{Channel, Delivery, DeliveryId, DeliveryStatus, TimingMode};
use crate::model::ledger::{CreditBalances, CreditType};
use crate::model::letter::LetterId;
use crate::policy::PolicyEngine;
use crate::repo::delivery_repo::{DeliveryListQuery, DeliveryRepository, SqliteDeliveryRepository};
use crate::repo::ledger_repo::{LedgerRepository, SqliteLedgerRepository};
use crate::repo::RepoError;
use crate::time::{parse_zone, to_local, Clock, ResolveError};
use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReadModelError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Repo(#[from] RepoError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryView {
    pub delivery_id: DeliveryId,
    pub letter_id: LetterId,
    pub status: &'static str,
    pub channel: &'static str,
    pub timing: Option<&'static str>,
    pub viewer_zone: String,
    /// RFC 3339 in the viewer's zone.
    pub send_at: Option<String>,
    pub arrive_at: Option<String>,
    pub delivered_at: Option<String>,
    pub next_retry_at: Option<String>,
    pub attempt_count: u32,
    pub last_failure_reason: Option<String>,
    /// Seconds left before cancel is refused; `None` once the window closed.
    pub seconds_until_cutoff: Option<i64>,
    pub can_cancel: bool,
}

pub struct ReadModelService<'conn, C: Clock> {
    conn: &'conn Connection,
    clock: C,
    policy: PolicyEngine,
}

impl<'conn, C: Clock> ReadModelService<'conn, C> {
    pub fn new(conn: &'conn Connection, clock: C, policy: PolicyEngine) -> Self {
        Self {
            conn,
            clock,
            policy,
        }
    }

    pub fn delivery_view(
        &self,
        owner_id: &str,
        id: DeliveryId,
        viewer_zone: &str,
    ) -> Result<DeliveryView, ReadModelError> {
        parse_zone(viewer_zone)?;
        let delivery = SqliteDeliveryRepository::try_new(self.conn)?
            .get_delivery(id)?
            .filter(|delivery| delivery.owner_id == owner_id)
            .ok_or(RepoError::NotFound {
                entity: "delivery",
                id,
            })?;
        self.render(&delivery, viewer_zone)
    }

    pub fn list_views(
        &self,
        owner_id: &str,
        query: &DeliveryListQuery,
        viewer_zone: &str,
    ) -> Result<Vec<DeliveryView>, ReadModelError> {
        parse_zone(viewer_zone)?;
        SqliteDeliveryRepository::try_new(self.conn)?
            .list_for_owner(owner_id, query)?
            .iter()
            .map(|delivery| self.render(delivery, viewer_zone))
            .collect()
    }

    pub fn balances(&self, owner_id: &str) -> Result<CreditBalances, ReadModelError> {
        let repo = SqliteLedgerRepository::try_new(self.conn)?;
        let mut balances = CreditBalances::default();
        for credit_type in CreditType::ALL {
            balances.set(credit_type, repo.balance(owner_id, credit_type)?);
        }
        Ok(balances)
    }

    fn render(&self, delivery: &Delivery, zone: &str) -> Result<DeliveryView, ReadModelError> {
        let now = self.clock.now();
        let local = |instant: Option<DateTime<Utc>>| -> Result<Option<String>, ResolveError> {
            instant
                .map(|value| to_local(value, zone).map(|local| local.to_rfc3339()))
                .transpose()
        };

        let cancelable_status = match delivery.status {
            DeliveryStatus::Scheduled => true,
            DeliveryStatus::Processing => delivery.send_started_at.is_none(),
            _ => false,
        };
        let seconds_until_cutoff = delivery
            .send_at
            .filter(|_| cancelable_status)
            .map(|send_at| (self.policy.cancellation_deadline(send_at) - now).num_seconds())
            .filter(|seconds| *seconds > 0);
        let can_cancel = cancelable_status
            && delivery
                .send_at
                .is_some_and(|send_at| self.policy.cancellation_cutoff(now, send_at).is_ok());

        Ok(DeliveryView {
            delivery_id: delivery.id,
            letter_id: delivery.letter_id,
            status: delivery.status.as_str(),
            channel: delivery.channel.as_str(),
            timing: delivery.timing.map(TimingMode::as_str),
            viewer_zone: zone.trim().to_string(),
            send_at: local(delivery.send_at)?,
            arrive_at: match delivery.channel {
                Channel::Email => None,
                Channel::PhysicalMail | Channel::Both => local(delivery.arrive_at)?,
            },
            delivered_at: local(delivery.delivered_at)?,
            next_retry_at: local(delivery.next_retry_at)?,
            attempt_count: delivery.attempt_count,
            last_failure_reason: delivery.last_failure_reason.clone(),
            seconds_until_cutoff,
            can_cancel,
        })
    }
}
