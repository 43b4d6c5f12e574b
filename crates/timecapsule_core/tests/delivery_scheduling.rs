mod common;

use chrono::{Datelike, Duration, FixedOffset, Weekday};
use common::*;
use rusqlite::Connection;
use timecapsule_core::repo::delivery_repo::DeliveryListQuery;
use timecapsule_core::service::ledger_service::LedgerError;
use timecapsule_core::{
    Channel, CreditType, DeliveryService, DeliveryServiceError, DeliveryStatus, LetterService,
    ManualClock, PolicyEngine, PolicyViolation, ProviderRegistry, ResolveError, TimingMode,
};

fn service<'c>(conn: &'c Connection, clock: &ManualClock) -> DeliveryService<'c, ManualClock> {
    DeliveryService::new(conn, clock.clone(), PolicyEngine::default())
}

#[test]
fn schedule_debits_seals_and_records_audit_event() {
    let (conn, clock) = setup();
    grant(&conn, &clock, OWNER, CreditType::Email, 3);
    let letter = letter(&conn, &clock, OWNER);

    let delivery = service(&conn, &clock)
        .schedule(&email_request(letter.id, local(2030, 1, 2, 9, 0, "America/New_York")))
        .unwrap();

    assert_eq!(delivery.status, DeliveryStatus::Scheduled);
    assert_eq!(delivery.version, 1);
    assert_eq!(delivery.send_at, Some(utc(2030, 1, 2, 14, 0)));
    assert_eq!(delivery.credit_debits.len(), 1);
    assert_eq!(balance(&conn, &clock, OWNER, CreditType::Email), 2);

    let stored = LetterService::new(&conn, clock.clone())
        .get_letter(OWNER, letter.id)
        .unwrap();
    assert!(stored.sealed);

    let events = service(&conn, &clock).events(OWNER, delivery.id).unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event, "schedule");
    assert_eq!(events[0].from_status, None);
    assert_eq!(events[0].to_status, DeliveryStatus::Scheduled);
}

#[test]
fn lead_time_and_horizon_windows_reject_before_any_write() {
    let (conn, clock) = setup();
    grant(&conn, &clock, OWNER, CreditType::Email, 3);
    let letter = letter(&conn, &clock, OWNER);
    let deliveries = service(&conn, &clock);

    // Four minutes after "now" (2030-01-01 00:00 UTC).
    let too_soon = deliveries.schedule(&email_request(letter.id, local(2030, 1, 1, 0, 4, "UTC")));
    assert!(matches!(
        too_soon,
        Err(DeliveryServiceError::Policy(PolicyViolation::LeadTimeTooShort { min_minutes: 5 }))
    ));

    let too_far = deliveries.schedule(&email_request(letter.id, local(2130, 1, 2, 0, 0, "UTC")));
    assert!(matches!(
        too_far,
        Err(DeliveryServiceError::Policy(PolicyViolation::HorizonTooFar { max_years: 100 }))
    ));

    assert_eq!(balance(&conn, &clock, OWNER, CreditType::Email), 3);
    let listed = deliveries
        .list_for_owner(OWNER, &DeliveryListQuery::default())
        .unwrap();
    assert!(listed.is_empty());

    let exactly_five = deliveries
        .schedule(&email_request(letter.id, local(2030, 1, 1, 0, 5, "UTC")))
        .unwrap();
    assert_eq!(exactly_five.status, DeliveryStatus::Scheduled);
}

#[test]
fn dst_gap_is_rejected_and_overlap_resolves_to_earlier_instant() {
    let (conn, clock) = setup();
    grant(&conn, &clock, OWNER, CreditType::Email, 3);
    let deliveries = service(&conn, &clock);

    // 2030-03-10 02:30 does not exist in New York.
    let gap_letter = letter(&conn, &clock, OWNER);
    let gap = deliveries.schedule(&email_request(
        gap_letter.id,
        local(2030, 3, 10, 2, 30, "America/New_York"),
    ));
    assert!(matches!(
        gap,
        Err(DeliveryServiceError::Resolve(ResolveError::NonexistentLocalTime { .. }))
    ));
    assert_eq!(balance(&conn, &clock, OWNER, CreditType::Email), 3);

    // 2030-11-03 01:30 happens twice; EDT (-04:00) comes first.
    let overlap_letter = letter(&conn, &clock, OWNER);
    let earlier = deliveries
        .schedule(&email_request(
            overlap_letter.id,
            local(2030, 11, 3, 1, 30, "America/New_York"),
        ))
        .unwrap();
    assert_eq!(earlier.send_at, Some(utc(2030, 11, 3, 5, 30)));

    let hinted_letter = letter(&conn, &clock, OWNER);
    let later = deliveries
        .schedule(&email_request(
            hinted_letter.id,
            local(2030, 11, 3, 1, 30, "America/New_York")
                .with_offset_hint(FixedOffset::west_opt(5 * 3600).unwrap()),
        ))
        .unwrap();
    assert_eq!(later.send_at, Some(utc(2030, 11, 3, 6, 30)));
}

#[test]
fn unknown_timezone_is_rejected() {
    let (conn, clock) = setup();
    grant(&conn, &clock, OWNER, CreditType::Email, 1);
    let letter = letter(&conn, &clock, OWNER);

    let result = service(&conn, &clock)
        .schedule(&email_request(letter.id, local(2030, 2, 1, 9, 0, "Mars/Olympus")));
    assert!(matches!(
        result,
        Err(DeliveryServiceError::Resolve(ResolveError::InvalidTimezone(_)))
    ));
}

#[test]
fn insufficient_credits_roll_back_the_whole_schedule() {
    let (conn, clock) = setup();
    grant(&conn, &clock, OWNER, CreditType::Email, 1);
    let letter = letter(&conn, &clock, OWNER);

    let mut request = email_request(letter.id, local(2030, 2, 1, 9, 0, "UTC"));
    request.channel = Channel::Both;
    request.recipient.address = Some(address("US"));

    let result = service(&conn, &clock).schedule(&request);
    assert!(matches!(
        result,
        Err(DeliveryServiceError::Ledger(LedgerError::InsufficientCredits {
            credit_type: CreditType::Mail,
            ..
        }))
    ));

    // The email debit taken before the mail debit failed is rolled back.
    assert_eq!(balance(&conn, &clock, OWNER, CreditType::Email), 1);
    let stored = LetterService::new(&conn, clock.clone())
        .get_letter(OWNER, letter.id)
        .unwrap();
    assert!(!stored.sealed);
    let listed = service(&conn, &clock)
        .list_for_owner(OWNER, &DeliveryListQuery::default())
        .unwrap();
    assert!(listed.is_empty());
}

#[test]
fn draft_delivery_is_promoted_with_latest_recipient() {
    let (conn, clock) = setup();
    grant(&conn, &clock, OWNER, CreditType::Email, 1);
    let letter = letter(&conn, &clock, OWNER);
    let deliveries = service(&conn, &clock);

    let draft = deliveries
        .create_draft(OWNER, letter.id, Channel::Email, email_recipient())
        .unwrap();
    assert_eq!(draft.status, DeliveryStatus::Draft);

    let mut request = email_request(letter.id, local(2030, 2, 1, 9, 0, "UTC"));
    request.recipient.email = Some("later@example.com".to_string());
    let scheduled = deliveries.schedule(&request).unwrap();

    assert_eq!(scheduled.id, draft.id);
    assert_eq!(scheduled.version, 1);
    let stored = deliveries.get(OWNER, draft.id).unwrap();
    assert_eq!(stored.recipient.email.as_deref(), Some("later@example.com"));
    assert_eq!(stored.timing, Some(TimingMode::SendOn));

    let second = deliveries.schedule(&email_request(letter.id, local(2030, 3, 1, 9, 0, "UTC")));
    assert!(matches!(
        second,
        Err(DeliveryServiceError::ActiveDeliveryExists(id)) if id == letter.id
    ));
}

#[test]
fn recipient_must_match_channel() {
    let (conn, clock) = setup();
    grant(&conn, &clock, OWNER, CreditType::Mail, 1);
    let letter = letter(&conn, &clock, OWNER);

    let mut request = email_request(letter.id, local(2030, 2, 1, 9, 0, "UTC"));
    request.channel = Channel::PhysicalMail;
    let result = service(&conn, &clock).schedule(&request);
    assert!(matches!(result, Err(DeliveryServiceError::Recipient(_))));
}

#[test]
fn arrive_by_monday_sends_on_monday_five_business_days_earlier() {
    let (conn, clock) = setup();
    grant(&conn, &clock, OWNER, CreditType::Mail, 1);
    let letter = letter(&conn, &clock, OWNER);

    // 2030-03-11 is a Monday.
    let delivery = service(&conn, &clock)
        .schedule(&mail_arrive_by(letter.id, local(2030, 3, 11, 10, 0, "UTC"), 5))
        .unwrap();

    let send_at = delivery.send_at.unwrap();
    assert_eq!(send_at, utc(2030, 3, 4, 10, 0));
    assert_eq!(send_at.weekday(), Weekday::Mon);
    assert_eq!(delivery.arrive_at, Some(utc(2030, 3, 11, 10, 0)));
    assert_eq!(delivery.transit_days, Some(5));
}

#[test]
fn arrive_by_requires_advance_notice_and_a_mail_channel() {
    let (conn, clock) = setup();
    grant(&conn, &clock, OWNER, CreditType::Mail, 1);
    grant(&conn, &clock, OWNER, CreditType::Email, 1);
    let deliveries = service(&conn, &clock);

    let short = letter(&conn, &clock, OWNER);
    let result = deliveries.schedule(&mail_arrive_by(short.id, local(2030, 1, 20, 10, 0, "UTC"), 5));
    assert!(matches!(
        result,
        Err(DeliveryServiceError::Policy(PolicyViolation::AdvanceNoticeTooShort { min_days: 30 }))
    ));

    let email_only = letter(&conn, &clock, OWNER);
    let mut request = email_request(email_only.id, local(2030, 3, 1, 10, 0, "UTC"));
    request.timing = TimingMode::ArriveBy;
    assert!(matches!(
        deliveries.schedule(&request),
        Err(DeliveryServiceError::InvalidRequest(_))
    ));
}

#[test]
fn oversized_or_unreachable_transit_is_rejected_before_any_write() {
    let (conn, clock) = setup();
    grant(&conn, &clock, OWNER, CreditType::Mail, 1);
    let letter = letter(&conn, &clock, OWNER);
    let deliveries = service(&conn, &clock);

    assert!(matches!(
        deliveries.schedule(&mail_arrive_by(
            letter.id,
            local(2030, 6, 3, 9, 0, "UTC"),
            200_000_000
        )),
        Err(DeliveryServiceError::Policy(PolicyViolation::TransitTooLong {
            requested: 200_000_000,
            max_days: 60,
        }))
    ));

    let mut send_on = mail_arrive_by(letter.id, local(2030, 6, 3, 9, 0, "UTC"), u32::MAX);
    send_on.timing = TimingMode::SendOn;
    assert!(matches!(
        deliveries.schedule(&send_on),
        Err(DeliveryServiceError::Policy(PolicyViolation::TransitTooLong { .. }))
    ));

    // Twenty-five business days before Sunday 2030-02-03 is Monday 2029-12-31.
    assert!(matches!(
        deliveries.schedule(&mail_arrive_by(letter.id, local(2030, 2, 3, 9, 0, "UTC"), 25)),
        Err(DeliveryServiceError::Policy(PolicyViolation::ArrivalUnreachable {
            computed_send_at,
        })) if computed_send_at == utc(2029, 12, 31, 9, 0)
    ));

    assert_eq!(balance(&conn, &clock, OWNER, CreditType::Mail), 1);
    assert!(deliveries
        .list_for_owner(OWNER, &DeliveryListQuery::default())
        .unwrap()
        .is_empty());
    assert!(!LetterService::new(&conn, clock.clone())
        .get_letter(OWNER, letter.id)
        .unwrap()
        .sealed);
}

#[test]
fn arrive_by_uses_provider_quote_then_transit_table() {
    let (conn, clock) = setup();
    grant(&conn, &clock, OWNER, CreditType::Mail, 2);

    let mut providers = ProviderRegistry::new();
    providers
        .register(FakeProvider::quoting(CreditType::Mail, 2))
        .unwrap();
    let quoted = DeliveryService::new(&conn, clock.clone(), PolicyEngine::default())
        .with_providers(providers);

    let first = letter(&conn, &clock, OWNER);
    let mut request = mail_arrive_by(first.id, local(2030, 3, 11, 10, 0, "UTC"), 0);
    request.transit_days = None;
    let delivery = quoted.schedule(&request).unwrap();
    assert_eq!(delivery.transit_days, Some(2));
    assert_eq!(delivery.send_at, Some(utc(2030, 3, 7, 10, 0)));

    // Domestic first class: 5 transit, 3 buffer and 2 early-arrival days.
    let second = letter(&conn, &clock, OWNER);
    let mut request = mail_arrive_by(second.id, local(2030, 3, 11, 10, 0, "UTC"), 0);
    request.transit_days = None;
    let delivery = service(&conn, &clock).schedule(&request).unwrap();
    assert_eq!(delivery.transit_days, Some(10));
}

#[test]
fn send_on_mail_projects_arrival_forward() {
    let (conn, clock) = setup();
    grant(&conn, &clock, OWNER, CreditType::Mail, 1);
    let letter = letter(&conn, &clock, OWNER);

    let mut request = mail_arrive_by(letter.id, local(2030, 3, 1, 10, 0, "UTC"), 3);
    request.timing = TimingMode::SendOn;
    let delivery = service(&conn, &clock).schedule(&request).unwrap();

    assert_eq!(delivery.send_at, Some(utc(2030, 3, 1, 10, 0)));
    // Friday plus three business days lands on Wednesday.
    assert_eq!(delivery.arrive_at, Some(utc(2030, 3, 6, 10, 0)));
}

#[test]
fn cancel_refunds_once_and_respects_cutoff_boundary() {
    let (conn, clock) = setup();
    grant(&conn, &clock, OWNER, CreditType::Email, 2);
    let deliveries = service(&conn, &clock);

    let early = letter(&conn, &clock, OWNER);
    let delivery = deliveries
        .schedule(&email_request(early.id, local(2030, 1, 10, 0, 0, "UTC")))
        .unwrap();
    assert_eq!(balance(&conn, &clock, OWNER, CreditType::Email), 1);

    let canceled = deliveries.cancel(OWNER, delivery.id).unwrap();
    assert_eq!(canceled.status, DeliveryStatus::Canceled);
    assert!(canceled.canceled_at.is_some());
    assert_eq!(balance(&conn, &clock, OWNER, CreditType::Email), 2);

    assert!(matches!(
        deliveries.cancel(OWNER, delivery.id),
        Err(DeliveryServiceError::Transition(_))
    ));
    assert_eq!(balance(&conn, &clock, OWNER, CreditType::Email), 2);

    // Exactly 72 hours before the send instant is already too late.
    let boundary = letter(&conn, &clock, OWNER);
    let delivery = deliveries
        .schedule(&email_request(boundary.id, local(2030, 1, 10, 0, 0, "UTC")))
        .unwrap();
    clock.set(utc(2030, 1, 7, 0, 0));
    assert!(matches!(
        deliveries.cancel(OWNER, delivery.id),
        Err(DeliveryServiceError::Policy(PolicyViolation::TooLateToCancel { cutoff_hours: 72 }))
    ));
    clock.set(utc(2030, 1, 7, 0, 0) - Duration::milliseconds(1));
    assert!(deliveries.cancel(OWNER, delivery.id).is_ok());
}

#[test]
fn foreign_owner_sees_not_found() {
    let (conn, clock) = setup();
    grant(&conn, &clock, OWNER, CreditType::Email, 1);
    let letter = letter(&conn, &clock, OWNER);
    let deliveries = service(&conn, &clock);
    let delivery = deliveries
        .schedule(&email_request(letter.id, local(2030, 2, 1, 9, 0, "UTC")))
        .unwrap();

    assert!(matches!(
        deliveries.cancel("someone_else", delivery.id),
        Err(DeliveryServiceError::NotFound { entity: "delivery", .. })
    ));
    let mut request = email_request(letter.id, local(2030, 2, 1, 9, 0, "UTC"));
    request.owner_id = "someone_else".to_string();
    assert!(matches!(
        deliveries.schedule(&request),
        Err(DeliveryServiceError::NotFound { entity: "letter", .. })
    ));
}

#[test]
fn delete_scheduled_delivery_refunds_with_delete_reason() {
    let (conn, clock) = setup();
    grant(&conn, &clock, OWNER, CreditType::Email, 1);
    let letter = letter(&conn, &clock, OWNER);
    let deliveries = service(&conn, &clock);
    let delivery = deliveries
        .schedule(&email_request(letter.id, local(2030, 2, 1, 9, 0, "UTC")))
        .unwrap();

    let deleted = deliveries.delete(OWNER, delivery.id).unwrap();
    assert_eq!(deleted.status, DeliveryStatus::Deleted);
    assert_eq!(balance(&conn, &clock, OWNER, CreditType::Email), 1);

    let listed = deliveries
        .list_for_owner(OWNER, &DeliveryListQuery::default())
        .unwrap();
    assert!(listed.is_empty());
    let with_deleted = deliveries
        .list_for_owner(
            OWNER,
            &DeliveryListQuery {
                status: Some(DeliveryStatus::Deleted),
                ..DeliveryListQuery::default()
            },
        )
        .unwrap();
    assert_eq!(with_deleted.len(), 1);
}

#[test]
fn deleting_letter_cascades_to_scheduled_delivery() {
    let (conn, clock) = setup();
    grant(&conn, &clock, OWNER, CreditType::Email, 1);
    let letter = letter(&conn, &clock, OWNER);
    let deliveries = service(&conn, &clock);
    let delivery = deliveries
        .schedule(&email_request(letter.id, local(2030, 2, 1, 9, 0, "UTC")))
        .unwrap();

    deliveries.delete_letter(OWNER, letter.id).unwrap();

    assert_eq!(balance(&conn, &clock, OWNER, CreditType::Email), 1);
    assert_eq!(
        deliveries.get(OWNER, delivery.id).unwrap().status,
        DeliveryStatus::Deleted
    );
    assert!(LetterService::new(&conn, clock.clone())
        .get_letter(OWNER, letter.id)
        .is_err());
}

#[test]
fn carrier_confirmation_requires_sent_status() {
    let (conn, clock) = setup();
    grant(&conn, &clock, OWNER, CreditType::Mail, 1);
    let letter = letter(&conn, &clock, OWNER);
    let deliveries = service(&conn, &clock);
    let delivery = deliveries
        .schedule(&mail_arrive_by(letter.id, local(2030, 3, 11, 10, 0, "UTC"), 5))
        .unwrap();

    assert!(matches!(
        deliveries.confirm_delivered(delivery.id, utc(2030, 3, 11, 9, 0)),
        Err(DeliveryServiceError::Transition(_))
    ));
}
