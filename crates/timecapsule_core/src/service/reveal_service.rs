//! Reveal gate for sealed letter content.
//!
//! # Invariants
//! - Content is revealable only once the effective instant has passed and
//!   the delivery reached `Sent` or `Delivered`.
//! - Mail-only deliveries additionally require `Delivered`.
//! - `first_opened_at` is written at most once, by the first successful
//!   evaluation; later reveals observe the stored instant.

use crate::model::delivery::{Channel, Delivery, DeliveryId, DeliveryStatus};
use crate::repo::delivery_repo::{DeliveryRepository, SqliteDeliveryRepository};
use crate::repo::RepoError;
use crate::time::Clock;
use chrono::{DateTime, Utc};
use log::info;
use rusqlite::Connection;

/// Pure gate evaluation.
pub fn can_reveal(delivery: &Delivery, now: DateTime<Utc>) -> bool {
    let status_allows = match delivery.channel {
        Channel::PhysicalMail => delivery.status == DeliveryStatus::Delivered,
        Channel::Email | Channel::Both => matches!(
            delivery.status,
            DeliveryStatus::Sent | DeliveryStatus::Delivered
        ),
    };
    status_allows
        && delivery
            .effective_instant()
            .is_some_and(|instant| instant <= now)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevealDecision {
    pub delivery_id: DeliveryId,
    pub revealed: bool,
    pub first_opened_at: Option<DateTime<Utc>>,
}

pub struct RevealGate<'conn, C: Clock> {
    conn: &'conn Connection,
    clock: C,
}

impl<'conn, C: Clock> RevealGate<'conn, C> {
    pub fn new(conn: &'conn Connection, clock: C) -> Self {
        Self { conn, clock }
    }

    /// Evaluates the gate for `viewer_id` and stamps the first open.
    ///
    /// Only the owner may view their delivery; anyone else gets `NotFound`.
    pub fn reveal(&self, viewer_id: &str, id: DeliveryId) -> Result<RevealDecision, RepoError> {
        let now = self.clock.now();
        let repo = SqliteDeliveryRepository::try_new(self.conn)?;
        let delivery = repo
            .get_delivery(id)?
            .filter(|delivery| delivery.owner_id == viewer_id)
            .ok_or(RepoError::NotFound {
                entity: "delivery",
                id,
            })?;

        if !can_reveal(&delivery, now) {
            return Ok(RevealDecision {
                delivery_id: id,
                revealed: false,
                first_opened_at: delivery.first_opened_at,
            });
        }

        if delivery.first_opened_at.is_some() {
            return Ok(RevealDecision {
                delivery_id: id,
                revealed: true,
                first_opened_at: delivery.first_opened_at,
            });
        }

        let first_opened_at = if repo.mark_first_opened(id, now)? {
            info!(
                "event=reveal_first_open module=reveal status=ok delivery_id={}",
                id
            );
            Some(now)
        } else {
            // A concurrent reveal stamped it first.
            repo.get_delivery(id)?
                .and_then(|stored| stored.first_opened_at)
        };

        Ok(RevealDecision {
            delivery_id: id,
            revealed: true,
            first_opened_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::can_reveal;
    use crate::model::delivery::{Channel, Delivery, DeliveryStatus, Recipient};
    use chrono::{Duration, TimeZone, Utc};
    use uuid::Uuid;

    fn delivery(channel: Channel, status: DeliveryStatus) -> Delivery {
        let now = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let mut delivery = Delivery::new_draft(
            Uuid::new_v4(),
            "user_1",
            channel,
            Recipient {
                is_self: true,
                email: Some("me@example.com".to_string()),
                address: None,
            },
            now,
        );
        delivery.status = status;
        delivery.send_at = Some(now + Duration::days(1));
        delivery.arrive_at = Some(now + Duration::days(8));
        delivery
    }

    #[test]
    fn email_reveals_after_send_instant_once_sent() {
        let sent = delivery(Channel::Email, DeliveryStatus::Sent);
        let send_at = sent.send_at.unwrap();
        assert!(!can_reveal(&sent, send_at - Duration::seconds(1)));
        assert!(can_reveal(&sent, send_at));

        let scheduled = delivery(Channel::Email, DeliveryStatus::Scheduled);
        assert!(!can_reveal(&scheduled, send_at + Duration::days(1)));
    }

    #[test]
    fn mail_only_requires_carrier_confirmation() {
        let sent = delivery(Channel::PhysicalMail, DeliveryStatus::Sent);
        let later = sent.arrive_at.unwrap() + Duration::days(1);
        assert!(!can_reveal(&sent, later));

        let mut delivered = delivery(Channel::PhysicalMail, DeliveryStatus::Delivered);
        delivered.delivered_at = Some(later - Duration::hours(2));
        assert!(can_reveal(&delivered, later));
    }
}
