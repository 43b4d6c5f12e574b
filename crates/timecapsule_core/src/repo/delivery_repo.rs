//! Delivery repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Persist delivery rows and their audit trail.
//! - Provide the version compare-and-swap every lifecycle write goes through.
//! - Answer the dispatcher's due/retry/stale queries.
//!
//! # Invariants
//! - `save_transition` only lands when the stored version equals the
//!   caller's expected version; the loser of a race gets `StaleState`.
//! - Every persisted version has exactly one `delivery_events` row.
//! - The partial unique index keeps one active delivery per letter; a
//!   violation surfaces as `ActiveDeliveryExists`.

use crate::db::to_epoch_ms;
use crate::lifecycle::{Transition, TransitionRecord};
use crate::model::delivery::{
    Channel, Delivery, DeliveryId, DeliveryStatus, MailingAddress, Recipient,
    RequestedLocalTime, TimingMode,
};
use crate::model::letter::LetterId;
use crate::repo::ledger_repo::load_debits;
use crate::repo::{
    bool_to_int, ensure_tables_ready, is_unique_violation, parse_bool, parse_instant,
    parse_optional_instant, parse_uuid, RepoError, RepoResult,
};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row};

const DELIVERY_SELECT_SQL: &str = "SELECT
    delivery_uuid,
    letter_uuid,
    owner_id,
    channel,
    recipient_is_self,
    recipient_email,
    recipient_address,
    timing_mode,
    local_date,
    local_time,
    time_zone,
    send_at,
    arrive_at,
    transit_days,
    status,
    version,
    attempt_count,
    last_attempt_at,
    last_failure_reason,
    next_retry_at,
    processing_started_at,
    send_started_at,
    email_sent_at,
    mail_sent_at,
    provider_ref,
    delivered_at,
    first_opened_at,
    created_at,
    updated_at,
    canceled_at
FROM deliveries";

const DELIVERY_COLUMNS: &[&str] = &[
    "delivery_uuid",
    "letter_uuid",
    "owner_id",
    "channel",
    "status",
    "version",
    "send_at",
    "next_retry_at",
    "processing_started_at",
    "first_opened_at",
];
const EVENT_COLUMNS: &[&str] = &["delivery_uuid", "version", "from_status", "to_status", "event"];

const LOCAL_TIME_FORMAT: &str = "%H:%M:%S";
const DEFAULT_LIST_LIMIT: u32 = 50;
const LIST_LIMIT_MAX: u32 = 200;

/// Persisted audit row for one delivery version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryEventRecord {
    pub delivery_id: DeliveryId,
    pub version: i64,
    pub from_status: Option<DeliveryStatus>,
    pub to_status: DeliveryStatus,
    pub event: String,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryListQuery {
    pub status: Option<DeliveryStatus>,
    /// Defaults to 50 and clamps to 200.
    pub limit: Option<u32>,
    pub offset: u32,
}

pub trait DeliveryRepository {
    /// Inserts a new delivery row together with its first audit event.
    fn insert_delivery(&self, delivery: &Delivery, event: &str) -> RepoResult<()>;
    fn get_delivery(&self, id: DeliveryId) -> RepoResult<Option<Delivery>>;
    fn find_active_for_letter(&self, letter_id: LetterId) -> RepoResult<Option<Delivery>>;
    fn list_for_owner(&self, owner_id: &str, query: &DeliveryListQuery)
        -> RepoResult<Vec<Delivery>>;
    /// Writes `transition.next` iff the row is still at `expected_version`.
    fn save_transition(&self, expected_version: i64, transition: &Transition) -> RepoResult<()>;
    fn due_scheduled(&self, now: DateTime<Utc>, limit: u32) -> RepoResult<Vec<DeliveryId>>;
    fn due_retries(&self, now: DateTime<Utc>, limit: u32) -> RepoResult<Vec<DeliveryId>>;
    fn stale_processing(
        &self,
        started_before: DateTime<Utc>,
        limit: u32,
    ) -> RepoResult<Vec<DeliveryId>>;
    /// Sets `first_opened_at` only if still null. Returns whether it was set.
    fn mark_first_opened(&self, id: DeliveryId, at: DateTime<Utc>) -> RepoResult<bool>;
    fn events_for_delivery(&self, id: DeliveryId) -> RepoResult<Vec<DeliveryEventRecord>>;
}

pub struct SqliteDeliveryRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteDeliveryRepository<'conn> {
    /// Constructs a repository from a migrated/ready connection.
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        ensure_tables_ready(
            conn,
            &[
                ("deliveries", DELIVERY_COLUMNS),
                ("delivery_events", EVENT_COLUMNS),
            ],
        )?;
        Ok(Self { conn })
    }

    fn insert_event(
        &self,
        delivery_id: DeliveryId,
        version: i64,
        from: Option<DeliveryStatus>,
        record: (&str, DeliveryStatus, Option<&str>),
        at: DateTime<Utc>,
    ) -> RepoResult<()> {
        let (event, to, detail) = record;
        self.conn.execute(
            "INSERT INTO delivery_events (
                delivery_uuid,
                version,
                from_status,
                to_status,
                event,
                detail,
                created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7);",
            params![
                delivery_id.to_string(),
                version,
                from.map(DeliveryStatus::as_str),
                to.as_str(),
                event,
                detail,
                to_epoch_ms(at),
            ],
        )?;
        Ok(())
    }

    fn select_ids(&self, sql: &str, cutoff: DateTime<Utc>, limit: u32) -> RepoResult<Vec<DeliveryId>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params![to_epoch_ms(cutoff), i64::from(limit)])?;
        let mut ids = Vec::new();
        while let Some(row) = rows.next()? {
            let text: String = row.get(0)?;
            ids.push(parse_uuid(&text, "deliveries.delivery_uuid")?);
        }
        Ok(ids)
    }

    fn load(&self, sql: &str, bind: &[Value]) -> RepoResult<Vec<Delivery>> {
        let mut stmt = self.conn.prepare(sql)?;
        let mut rows = stmt.query(params_from_iter(bind.iter()))?;
        let mut deliveries = Vec::new();
        while let Some(row) = rows.next()? {
            let mut delivery = parse_delivery_row(row)?;
            delivery.credit_debits = load_debits(self.conn, delivery.id)?;
            deliveries.push(delivery);
        }
        Ok(deliveries)
    }
}

impl DeliveryRepository for SqliteDeliveryRepository<'_> {
    fn insert_delivery(&self, delivery: &Delivery, event: &str) -> RepoResult<()> {
        let address_json = encode_address(delivery.recipient.address.as_ref())?;
        let local = delivery.requested_local.as_ref();

        let inserted = self.conn.execute(
            "INSERT INTO deliveries (
                delivery_uuid,
                letter_uuid,
                owner_id,
                channel,
                recipient_is_self,
                recipient_email,
                recipient_address,
                timing_mode,
                local_date,
                local_time,
                time_zone,
                send_at,
                arrive_at,
                transit_days,
                status,
                version,
                attempt_count,
                created_at,
                updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19);",
            params![
                delivery.id.to_string(),
                delivery.letter_id.to_string(),
                delivery.owner_id.as_str(),
                delivery.channel.as_str(),
                bool_to_int(delivery.recipient.is_self),
                delivery.recipient.email.as_deref(),
                address_json,
                delivery.timing.map(TimingMode::as_str),
                local.map(|value| value.date.to_string()),
                local.map(|value| value.time.format(LOCAL_TIME_FORMAT).to_string()),
                local.map(|value| value.zone.as_str()),
                delivery.send_at.map(to_epoch_ms),
                delivery.arrive_at.map(to_epoch_ms),
                delivery.transit_days,
                delivery.status.as_str(),
                delivery.version,
                delivery.attempt_count,
                to_epoch_ms(delivery.created_at),
                to_epoch_ms(delivery.updated_at),
            ],
        );

        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                return Err(RepoError::ActiveDeliveryExists {
                    letter_id: delivery.letter_id,
                });
            }
            Err(err) => return Err(err.into()),
        }

        self.insert_event(
            delivery.id,
            delivery.version,
            None,
            (event, delivery.status, None),
            delivery.created_at,
        )
    }

    fn get_delivery(&self, id: DeliveryId) -> RepoResult<Option<Delivery>> {
        let sql = format!("{DELIVERY_SELECT_SQL} WHERE delivery_uuid = ?1;");
        Ok(self
            .load(&sql, &[Value::Text(id.to_string())])?
            .into_iter()
            .next())
    }

    fn find_active_for_letter(&self, letter_id: LetterId) -> RepoResult<Option<Delivery>> {
        let sql = format!(
            "{DELIVERY_SELECT_SQL}
             WHERE letter_uuid = ?1
               AND status IN ('draft', 'scheduled', 'processing', 'sent', 'failed_retry')
             LIMIT 1;"
        );
        Ok(self
            .load(&sql, &[Value::Text(letter_id.to_string())])?
            .into_iter()
            .next())
    }

    fn list_for_owner(
        &self,
        owner_id: &str,
        query: &DeliveryListQuery,
    ) -> RepoResult<Vec<Delivery>> {
        let mut sql = format!("{DELIVERY_SELECT_SQL} WHERE owner_id = ?");
        let mut bind_values = vec![Value::Text(owner_id.to_string())];

        match query.status {
            Some(status) => {
                sql.push_str(" AND status = ?");
                bind_values.push(Value::Text(status.as_str().to_string()));
            }
            None => sql.push_str(" AND status <> 'deleted'"),
        }

        sql.push_str(" ORDER BY created_at DESC, delivery_uuid ASC LIMIT ?");
        bind_values.push(Value::Integer(i64::from(normalize_list_limit(query.limit))));
        if query.offset > 0 {
            sql.push_str(" OFFSET ?");
            bind_values.push(Value::Integer(i64::from(query.offset)));
        }

        self.load(&sql, &bind_values)
    }

    fn save_transition(&self, expected_version: i64, transition: &Transition) -> RepoResult<()> {
        let next = &transition.next;
        let address_json = encode_address(next.recipient.address.as_ref())?;
        let changed = self.conn.execute(
            "UPDATE deliveries
             SET
                timing_mode = ?3,
                local_date = ?4,
                local_time = ?5,
                time_zone = ?6,
                send_at = ?7,
                arrive_at = ?8,
                transit_days = ?9,
                status = ?10,
                version = ?11,
                attempt_count = ?12,
                last_attempt_at = ?13,
                last_failure_reason = ?14,
                next_retry_at = ?15,
                processing_started_at = ?16,
                send_started_at = ?17,
                email_sent_at = ?18,
                mail_sent_at = ?19,
                provider_ref = ?20,
                delivered_at = ?21,
                updated_at = ?22,
                canceled_at = ?23,
                channel = ?24,
                recipient_is_self = ?25,
                recipient_email = ?26,
                recipient_address = ?27
             WHERE delivery_uuid = ?1
               AND version = ?2;",
            params![
                next.id.to_string(),
                expected_version,
                next.timing.map(TimingMode::as_str),
                next.requested_local.as_ref().map(|value| value.date.to_string()),
                next.requested_local
                    .as_ref()
                    .map(|value| value.time.format(LOCAL_TIME_FORMAT).to_string()),
                next.requested_local.as_ref().map(|value| value.zone.as_str()),
                next.send_at.map(to_epoch_ms),
                next.arrive_at.map(to_epoch_ms),
                next.transit_days,
                next.status.as_str(),
                next.version,
                next.attempt_count,
                next.last_attempt_at.map(to_epoch_ms),
                next.last_failure_reason.as_deref(),
                next.next_retry_at.map(to_epoch_ms),
                next.processing_started_at.map(to_epoch_ms),
                next.send_started_at.map(to_epoch_ms),
                next.email_sent_at.map(to_epoch_ms),
                next.mail_sent_at.map(to_epoch_ms),
                next.provider_ref.as_deref(),
                next.delivered_at.map(to_epoch_ms),
                to_epoch_ms(next.updated_at),
                next.canceled_at.map(to_epoch_ms),
                next.channel.as_str(),
                bool_to_int(next.recipient.is_self),
                next.recipient.email.as_deref(),
                address_json,
            ],
        );

        let changed = match changed {
            Ok(changed) => changed,
            Err(err) if is_unique_violation(&err) => {
                return Err(RepoError::ActiveDeliveryExists {
                    letter_id: next.letter_id,
                });
            }
            Err(err) => return Err(err.into()),
        };

        if changed == 0 {
            let exists: i64 = self.conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM deliveries WHERE delivery_uuid = ?1);",
                [next.id.to_string()],
                |row| row.get(0),
            )?;
            if exists == 1 {
                return Err(RepoError::StaleState {
                    id: next.id,
                    expected_version,
                });
            }
            return Err(RepoError::NotFound {
                entity: "delivery",
                id: next.id,
            });
        }

        let TransitionRecord {
            from,
            to,
            event,
            detail,
        } = &transition.record;
        self.insert_event(
            next.id,
            next.version,
            Some(*from),
            (*event, *to, detail.as_deref()),
            next.updated_at,
        )
    }

    fn due_scheduled(&self, now: DateTime<Utc>, limit: u32) -> RepoResult<Vec<DeliveryId>> {
        self.select_ids(
            "SELECT delivery_uuid
             FROM deliveries
             WHERE status = 'scheduled'
               AND send_at <= ?1
             ORDER BY send_at ASC, delivery_uuid ASC
             LIMIT ?2;",
            now,
            limit,
        )
    }

    fn due_retries(&self, now: DateTime<Utc>, limit: u32) -> RepoResult<Vec<DeliveryId>> {
        self.select_ids(
            "SELECT delivery_uuid
             FROM deliveries
             WHERE status = 'failed_retry'
               AND next_retry_at <= ?1
             ORDER BY next_retry_at ASC, delivery_uuid ASC
             LIMIT ?2;",
            now,
            limit,
        )
    }

    fn stale_processing(
        &self,
        started_before: DateTime<Utc>,
        limit: u32,
    ) -> RepoResult<Vec<DeliveryId>> {
        self.select_ids(
            "SELECT delivery_uuid
             FROM deliveries
             WHERE status = 'processing'
               AND processing_started_at <= ?1
             ORDER BY processing_started_at ASC, delivery_uuid ASC
             LIMIT ?2;",
            started_before,
            limit,
        )
    }

    fn mark_first_opened(&self, id: DeliveryId, at: DateTime<Utc>) -> RepoResult<bool> {
        let changed = self.conn.execute(
            "UPDATE deliveries
             SET first_opened_at = ?2
             WHERE delivery_uuid = ?1
               AND first_opened_at IS NULL
               AND status IN ('sent', 'delivered');",
            params![id.to_string(), to_epoch_ms(at)],
        )?;
        Ok(changed == 1)
    }

    fn events_for_delivery(&self, id: DeliveryId) -> RepoResult<Vec<DeliveryEventRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT delivery_uuid, version, from_status, to_status, event, detail, created_at
             FROM delivery_events
             WHERE delivery_uuid = ?1
             ORDER BY version ASC;",
        )?;
        let mut rows = stmt.query([id.to_string()])?;
        let mut events = Vec::new();
        while let Some(row) = rows.next()? {
            let id_text: String = row.get("delivery_uuid")?;
            let from_status = match row.get::<_, Option<String>>("from_status")? {
                Some(value) => Some(parse_status(&value, "delivery_events.from_status")?),
                None => None,
            };
            let to_text: String = row.get("to_status")?;
            events.push(DeliveryEventRecord {
                delivery_id: parse_uuid(&id_text, "delivery_events.delivery_uuid")?,
                version: row.get("version")?,
                from_status,
                to_status: parse_status(&to_text, "delivery_events.to_status")?,
                event: row.get("event")?,
                detail: row.get("detail")?,
                created_at: parse_instant(row.get("created_at")?, "delivery_events.created_at")?,
            });
        }
        Ok(events)
    }
}

/// Normalizes list limit according to the delivery list contract.
pub fn normalize_list_limit(limit: Option<u32>) -> u32 {
    match limit {
        Some(0) | None => DEFAULT_LIST_LIMIT,
        Some(value) if value > LIST_LIMIT_MAX => LIST_LIMIT_MAX,
        Some(value) => value,
    }
}

fn encode_address(address: Option<&MailingAddress>) -> RepoResult<Option<String>> {
    address
        .map(|value| {
            serde_json::to_string(value).map_err(|err| {
                RepoError::InvalidData(format!("failed to encode mailing address: {err}"))
            })
        })
        .transpose()
}

fn parse_delivery_row(row: &Row<'_>) -> RepoResult<Delivery> {
    let id_text: String = row.get("delivery_uuid")?;
    let letter_text: String = row.get("letter_uuid")?;

    let channel_text: String = row.get("channel")?;
    let channel = Channel::parse(&channel_text).ok_or_else(|| {
        RepoError::InvalidData(format!("invalid channel `{channel_text}` in deliveries.channel"))
    })?;

    let status_text: String = row.get("status")?;
    let status = parse_status(&status_text, "deliveries.status")?;

    let timing = match row.get::<_, Option<String>>("timing_mode")? {
        Some(value) => Some(TimingMode::parse(&value).ok_or_else(|| {
            RepoError::InvalidData(format!("invalid timing mode `{value}` in deliveries.timing_mode"))
        })?),
        None => None,
    };

    let address = match row.get::<_, Option<String>>("recipient_address")? {
        Some(raw) => Some(serde_json::from_str::<MailingAddress>(&raw).map_err(|err| {
            RepoError::InvalidData(format!("invalid deliveries.recipient_address: {err}"))
        })?),
        None => None,
    };

    let requested_local = parse_requested_local(
        row.get("local_date")?,
        row.get("local_time")?,
        row.get("time_zone")?,
    )?;

    let attempt_count: i64 = row.get("attempt_count")?;
    let transit_days: Option<i64> = row.get("transit_days")?;

    Ok(Delivery {
        id: parse_uuid(&id_text, "deliveries.delivery_uuid")?,
        letter_id: parse_uuid(&letter_text, "deliveries.letter_uuid")?,
        owner_id: row.get("owner_id")?,
        channel,
        recipient: Recipient {
            is_self: parse_bool(row.get("recipient_is_self")?, "deliveries.recipient_is_self")?,
            email: row.get("recipient_email")?,
            address,
        },
        timing,
        requested_local,
        send_at: parse_optional_instant(row.get("send_at")?, "deliveries.send_at")?,
        arrive_at: parse_optional_instant(row.get("arrive_at")?, "deliveries.arrive_at")?,
        transit_days: transit_days
            .map(|value| to_u32(value, "deliveries.transit_days"))
            .transpose()?,
        status,
        version: row.get("version")?,
        attempt_count: to_u32(attempt_count, "deliveries.attempt_count")?,
        last_attempt_at: parse_optional_instant(
            row.get("last_attempt_at")?,
            "deliveries.last_attempt_at",
        )?,
        last_failure_reason: row.get("last_failure_reason")?,
        next_retry_at: parse_optional_instant(row.get("next_retry_at")?, "deliveries.next_retry_at")?,
        processing_started_at: parse_optional_instant(
            row.get("processing_started_at")?,
            "deliveries.processing_started_at",
        )?,
        send_started_at: parse_optional_instant(
            row.get("send_started_at")?,
            "deliveries.send_started_at",
        )?,
        email_sent_at: parse_optional_instant(row.get("email_sent_at")?, "deliveries.email_sent_at")?,
        mail_sent_at: parse_optional_instant(row.get("mail_sent_at")?, "deliveries.mail_sent_at")?,
        provider_ref: row.get("provider_ref")?,
        delivered_at: parse_optional_instant(row.get("delivered_at")?, "deliveries.delivered_at")?,
        first_opened_at: parse_optional_instant(
            row.get("first_opened_at")?,
            "deliveries.first_opened_at",
        )?,
        credit_debits: Vec::new(),
        created_at: parse_instant(row.get("created_at")?, "deliveries.created_at")?,
        updated_at: parse_instant(row.get("updated_at")?, "deliveries.updated_at")?,
        canceled_at: parse_optional_instant(row.get("canceled_at")?, "deliveries.canceled_at")?,
    })
}

fn parse_requested_local(
    date: Option<String>,
    time: Option<String>,
    zone: Option<String>,
) -> RepoResult<Option<RequestedLocalTime>> {
    match (date, time, zone) {
        (Some(date), Some(time), Some(zone)) => {
            let date = NaiveDate::parse_from_str(&date, "%Y-%m-%d").map_err(|_| {
                RepoError::InvalidData(format!("invalid local date `{date}` in deliveries.local_date"))
            })?;
            let time = NaiveTime::parse_from_str(&time, LOCAL_TIME_FORMAT).map_err(|_| {
                RepoError::InvalidData(format!("invalid local time `{time}` in deliveries.local_time"))
            })?;
            Ok(Some(RequestedLocalTime { date, time, zone }))
        }
        (None, None, None) => Ok(None),
        _ => Err(RepoError::InvalidData(
            "deliveries.local_date/local_time/time_zone must be all set or all null".to_string(),
        )),
    }
}

fn parse_status(value: &str, column: &str) -> RepoResult<DeliveryStatus> {
    DeliveryStatus::parse(value)
        .ok_or_else(|| RepoError::InvalidData(format!("invalid status `{value}` in {column}")))
}

fn to_u32(value: i64, column: &str) -> RepoResult<u32> {
    u32::try_from(value)
        .map_err(|_| RepoError::InvalidData(format!("value `{value}` out of range in {column}")))
}
