mod common;

use common::*;
use std::sync::{Arc, Barrier};
use std::thread;
use timecapsule_core::service::{DebitRequest, LedgerError, RefundOutcome};
use timecapsule_core::{
    open_db, Channel, CreditType, DeliveryService, DeliveryStatus, DispatchConfig,
    DispatchScheduler, LedgerReason, LedgerService, ManualClock, PolicyEngine, ProviderRegistry,
    RetryConfig,
};

fn debit(user: &str, key: Option<&str>) -> DebitRequest {
    DebitRequest {
        user_id: user.to_string(),
        credit_type: CreditType::Email,
        amount: 1,
        related_delivery: None,
        idempotency_key: key.map(str::to_string),
    }
}

#[test]
fn grant_replay_returns_original_entry_and_rejects_changed_parameters() {
    let (conn, clock) = setup();
    let ledger = LedgerService::new(&conn, clock.clone());

    let first = ledger.grant(OWNER, CreditType::Email, 3, "payment-1").unwrap();
    let replay = ledger.grant(OWNER, CreditType::Email, 3, "payment-1").unwrap();
    assert_eq!(first, replay);
    assert_eq!(ledger.balance(OWNER, CreditType::Email).unwrap(), 3);

    assert!(matches!(
        ledger.grant(OWNER, CreditType::Email, 5, "payment-1"),
        Err(LedgerError::IdempotencyConflict(key)) if key == "payment-1"
    ));
    assert!(matches!(
        ledger.grant(OWNER, CreditType::Mail, 0, "payment-2"),
        Err(LedgerError::InvalidAmount(0))
    ));
}

#[test]
fn debit_never_goes_negative_and_replays_by_key() {
    let (conn, clock) = setup();
    grant(&conn, &clock, OWNER, CreditType::Email, 1);
    let ledger = LedgerService::new(&conn, clock.clone());

    let entry = ledger.debit(&debit(OWNER, Some("debit-1"))).unwrap();
    assert_eq!(entry.delta, -1);
    assert_eq!(entry.reason, LedgerReason::Schedule);

    let replay = ledger.debit(&debit(OWNER, Some("debit-1"))).unwrap();
    assert_eq!(replay.id, entry.id);
    assert_eq!(ledger.balance(OWNER, CreditType::Email).unwrap(), 0);

    assert!(matches!(
        ledger.debit(&debit(OWNER, Some("debit-2"))),
        Err(LedgerError::InsufficientCredits {
            credit_type: CreditType::Email,
            requested: 1,
            available: 0,
        })
    ));
}

#[test]
fn cancel_refunds_exactly_what_was_debited_once() {
    let (conn, clock) = setup();
    grant(&conn, &clock, OWNER, CreditType::Email, 2);
    grant(&conn, &clock, OWNER, CreditType::Mail, 2);
    let letter = letter(&conn, &clock, OWNER);

    let mut request = email_request(letter.id, local(2030, 2, 1, 9, 0, "UTC"));
    request.channel = Channel::Both;
    request.recipient.address = Some(address("US"));
    request.transit_days = Some(3);
    let deliveries = DeliveryService::new(&conn, clock.clone(), PolicyEngine::default());
    let delivery = deliveries.schedule(&request).unwrap();

    let ledger = LedgerService::new(&conn, clock.clone());
    let balances = ledger.balances(OWNER).unwrap();
    assert_eq!((balances.email, balances.mail), (1, 1));

    deliveries.cancel(OWNER, delivery.id).unwrap();
    let balances = ledger.balances(OWNER).unwrap();
    assert_eq!((balances.email, balances.mail), (2, 2));

    assert_eq!(
        ledger.refund(delivery.id, LedgerReason::Refund).unwrap(),
        RefundOutcome::NoOp
    );
    let balances = ledger.balances(OWNER).unwrap();
    assert_eq!((balances.email, balances.mail), (2, 2));

    let refunds: Vec<_> = ledger
        .entries_for_user(OWNER)
        .unwrap()
        .into_iter()
        .filter(|entry| entry.reason == LedgerReason::Cancel)
        .collect();
    assert_eq!(refunds.len(), 2);
    assert!(refunds.iter().all(|entry| entry.delta == 1
        && entry.related_delivery_id == Some(delivery.id)));
}

#[test]
fn concurrent_debits_for_last_credit_let_exactly_one_win() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.db");
    let clock = ManualClock::new(start());
    {
        let conn = open_db(&path).unwrap();
        grant(&conn, &clock, OWNER, CreditType::Email, 1);
    }

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let path = path.clone();
            let clock = clock.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let conn = open_db(&path).unwrap();
                let ledger = LedgerService::new(&conn, clock);
                barrier.wait();
                ledger.debit(&debit(OWNER, None))
            })
        })
        .collect();
    let results: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();

    assert_eq!(results.iter().filter(|result| result.is_ok()).count(), 1);
    assert_eq!(
        results
            .iter()
            .filter(|result| matches!(result, Err(LedgerError::InsufficientCredits { .. })))
            .count(),
        1
    );

    let conn = open_db(&path).unwrap();
    assert_eq!(balance(&conn, &clock, OWNER, CreditType::Email), 0);
}

#[test]
fn reconcile_reports_and_repairs_cache_drift() {
    let (conn, clock) = setup();
    grant(&conn, &clock, OWNER, CreditType::Email, 3);
    grant(&conn, &clock, "user_2", CreditType::Mail, 1);
    conn.execute(
        "UPDATE credit_balances SET balance = 7 WHERE user_id = ?1 AND credit_type = 'email';",
        [OWNER],
    )
    .unwrap();

    let ledger = LedgerService::new(&conn, clock.clone());
    let report = ledger.reconcile_balances(false).unwrap();
    assert_eq!(report.drifted.len(), 1);
    assert_eq!(report.drifted[0].user_id, OWNER);
    assert_eq!(report.drifted[0].cached, Some(7));
    assert_eq!(report.drifted[0].derived, 3);
    assert!(!report.repaired);
    assert_eq!(ledger.balance(OWNER, CreditType::Email).unwrap(), 7);

    let report = ledger.reconcile_balances(true).unwrap();
    assert!(report.repaired);
    assert_eq!(ledger.balance(OWNER, CreditType::Email).unwrap(), 3);
    assert!(ledger.reconcile_balances(false).unwrap().drifted.is_empty());
}

#[test]
fn refund_is_refused_for_live_deliveries_and_non_refund_reasons() {
    let (conn, clock) = setup();
    grant(&conn, &clock, OWNER, CreditType::Email, 1);
    let letter = letter(&conn, &clock, OWNER);
    let deliveries = DeliveryService::new(&conn, clock.clone(), PolicyEngine::default());
    let delivery = deliveries
        .schedule(&email_request(letter.id, local(2030, 1, 2, 9, 0, "UTC")))
        .unwrap();
    let ledger = LedgerService::new(&conn, clock.clone());

    assert!(matches!(
        ledger.refund(delivery.id, LedgerReason::Purchase),
        Err(LedgerError::InvalidRefundReason(LedgerReason::Purchase))
    ));
    assert!(matches!(
        ledger.refund(delivery.id, LedgerReason::Refund),
        Err(LedgerError::RefundNotAllowed {
            status: DeliveryStatus::Scheduled,
            ..
        })
    ));
    assert_eq!(ledger.balance(OWNER, CreditType::Email).unwrap(), 0);

    let mut providers = ProviderRegistry::new();
    providers.register(FakeProvider::new(CreditType::Email)).unwrap();
    clock.set(utc(2030, 1, 2, 9, 0));
    let report = DispatchScheduler::new(
        &conn,
        clock.clone(),
        providers,
        RetryConfig::default(),
        DispatchConfig::default(),
    )
    .run_tick()
    .unwrap();
    assert_eq!(report.sent, 1);

    assert!(matches!(
        ledger.refund(delivery.id, LedgerReason::Refund),
        Err(LedgerError::RefundNotAllowed {
            status: DeliveryStatus::Sent,
            ..
        })
    ));
    assert_eq!(ledger.balance(OWNER, CreditType::Email).unwrap(), 0);
    assert!(ledger
        .entries_for_user(OWNER)
        .unwrap()
        .iter()
        .all(|entry| !entry.reason.is_refund()));
}
