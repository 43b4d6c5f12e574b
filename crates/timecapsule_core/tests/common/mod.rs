#![allow(dead_code)]

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use rusqlite::Connection;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use timecapsule_core::db::open_db_in_memory;
use timecapsule_core::provider::{SendError, SendProvider, SendReceipt, SendRequest};
use timecapsule_core::{
    Channel, CreditType, Letter, LetterService, LedgerService, LocalTimeRequest, MailingAddress,
    ManualClock, Recipient, ScheduleRequest, TimingMode,
};
use uuid::Uuid;

pub const OWNER: &str = "user_1";

pub fn utc(y: i32, m: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, mi, 0).unwrap()
}

/// Tuesday 2030-01-01 00:00 UTC.
pub fn start() -> DateTime<Utc> {
    utc(2030, 1, 1, 0, 0)
}

pub fn setup() -> (Connection, ManualClock) {
    (open_db_in_memory().unwrap(), ManualClock::new(start()))
}

pub fn grant(conn: &Connection, clock: &ManualClock, user: &str, credit_type: CreditType, amount: i64) {
    LedgerService::new(conn, clock.clone())
        .grant(
            user,
            credit_type,
            amount,
            &format!("payment-{}", Uuid::new_v4()),
        )
        .unwrap();
}

pub fn balance(conn: &Connection, clock: &ManualClock, user: &str, credit_type: CreditType) -> i64 {
    LedgerService::new(conn, clock.clone())
        .balance(user, credit_type)
        .unwrap()
}

pub fn letter(conn: &Connection, clock: &ManualClock, owner: &str) -> Letter {
    LetterService::new(conn, clock.clone())
        .create_letter(owner, "Dear future me", "content/handle-1")
        .unwrap()
}

pub fn email_recipient() -> Recipient {
    Recipient {
        is_self: true,
        email: Some("me@example.com".to_string()),
        address: None,
    }
}

pub fn address(country_code: &str) -> MailingAddress {
    MailingAddress {
        name: "Future Me".to_string(),
        line1: "1 Main St".to_string(),
        line2: None,
        city: "Springfield".to_string(),
        region: Some("IL".to_string()),
        postal_code: "62701".to_string(),
        country_code: country_code.to_string(),
    }
}

pub fn mail_recipient() -> Recipient {
    Recipient {
        is_self: true,
        email: None,
        address: Some(address("US")),
    }
}

pub fn local(y: i32, m: u32, d: u32, h: u32, mi: u32, zone: &str) -> LocalTimeRequest {
    LocalTimeRequest::new(
        NaiveDate::from_ymd_opt(y, m, d).unwrap(),
        NaiveTime::from_hms_opt(h, mi, 0).unwrap(),
        zone,
    )
}

pub fn email_request(letter_id: Uuid, local: LocalTimeRequest) -> ScheduleRequest {
    ScheduleRequest {
        owner_id: OWNER.to_string(),
        letter_id,
        channel: Channel::Email,
        recipient: email_recipient(),
        timing: TimingMode::SendOn,
        local,
        mail_class: None,
        transit_days: None,
    }
}

pub fn mail_arrive_by(letter_id: Uuid, local: LocalTimeRequest, transit_days: u32) -> ScheduleRequest {
    ScheduleRequest {
        owner_id: OWNER.to_string(),
        letter_id,
        channel: Channel::PhysicalMail,
        recipient: mail_recipient(),
        timing: TimingMode::ArriveBy,
        local,
        mail_class: None,
        transit_days: Some(transit_days),
    }
}

/// Provider that replays scripted results and records every request.
pub struct FakeProvider {
    id: String,
    kind: CreditType,
    script: Mutex<VecDeque<Result<(), SendError>>>,
    calls: Mutex<Vec<SendRequest>>,
    quote: Option<u32>,
}

impl FakeProvider {
    pub fn new(kind: CreditType) -> Arc<Self> {
        Self::build(kind, Vec::new(), None)
    }

    pub fn scripted(kind: CreditType, script: Vec<Result<(), SendError>>) -> Arc<Self> {
        Self::build(kind, script, None)
    }

    pub fn quoting(kind: CreditType, days: u32) -> Arc<Self> {
        Self::build(kind, Vec::new(), Some(days))
    }

    fn build(kind: CreditType, script: Vec<Result<(), SendError>>, quote: Option<u32>) -> Arc<Self> {
        Arc::new(Self {
            id: format!("fake_{}", kind.as_str()),
            kind,
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
            quote,
        })
    }

    pub fn calls(&self) -> Vec<SendRequest> {
        self.calls.lock().unwrap().clone()
    }
}

impl SendProvider for FakeProvider {
    fn provider_id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> CreditType {
        self.kind
    }

    fn send(&self, request: &SendRequest) -> Result<SendReceipt, SendError> {
        self.calls.lock().unwrap().push(request.clone());
        match self.script.lock().unwrap().pop_front() {
            Some(Err(err)) => Err(err),
            Some(Ok(())) | None => Ok(SendReceipt {
                provider_ref: format!("{}-{}", self.id, request.idempotency_key),
                transit_days: None,
            }),
        }
    }

    fn quote_transit_days(&self, _address: &MailingAddress) -> Option<u32> {
        self.quote
    }
}
