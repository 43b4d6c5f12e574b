//! Credit ledger repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Persist append-only ledger entries and the per-user balance cache.
//! - Persist the delivery-to-debit link rows used for exact refunds.
//!
//! # Invariants
//! - A debit only lands when `balance >= amount` in the same statement.
//! - `credit_balances.balance` never goes negative (CHECK constraint).
//! - `ledger_entries` rows are never updated or deleted (triggers).

use crate::db::to_epoch_ms;
use crate::model::delivery::DeliveryId;
use crate::model::ledger::{CreditDebit, CreditType, LedgerEntry, LedgerReason};
use crate::repo::{
    ensure_tables_ready, parse_instant, parse_uuid, RepoError, RepoResult,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

const LEDGER_SELECT_SQL: &str = "SELECT
    entry_uuid,
    user_id,
    credit_type,
    delta,
    reason,
    related_delivery_uuid,
    idempotency_key,
    created_at
FROM ledger_entries";

const LEDGER_ENTRY_COLUMNS: &[&str] = &[
    "entry_uuid",
    "user_id",
    "credit_type",
    "delta",
    "reason",
    "related_delivery_uuid",
    "idempotency_key",
];
const BALANCE_COLUMNS: &[&str] = &["user_id", "credit_type", "balance"];
const DEBIT_LINK_COLUMNS: &[&str] = &["delivery_uuid", "credit_type", "amount", "ledger_entry_uuid"];

/// Cached and log-derived balance for one `(user, credit type)` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceSnapshot {
    pub user_id: String,
    pub credit_type: CreditType,
    pub cached: Option<i64>,
    pub derived: i64,
}

pub trait LedgerRepository {
    fn find_entry_by_key(&self, idempotency_key: &str) -> RepoResult<Option<LedgerEntry>>;
    fn insert_entry(&self, entry: &LedgerEntry) -> RepoResult<()>;
    /// Decrements the cached balance iff it covers `amount`.
    fn try_decrement_balance(
        &self,
        user_id: &str,
        credit_type: CreditType,
        amount: i64,
        now: DateTime<Utc>,
    ) -> RepoResult<bool>;
    fn increment_balance(
        &self,
        user_id: &str,
        credit_type: CreditType,
        amount: i64,
        now: DateTime<Utc>,
    ) -> RepoResult<()>;
    fn balance(&self, user_id: &str, credit_type: CreditType) -> RepoResult<i64>;
    fn entries_for_user(&self, user_id: &str) -> RepoResult<Vec<LedgerEntry>>;
    fn link_debit(&self, delivery_id: DeliveryId, debit: &CreditDebit) -> RepoResult<()>;
    fn debits_for_delivery(&self, delivery_id: DeliveryId) -> RepoResult<Vec<CreditDebit>>;
    /// Removes every debit link of `delivery_id` and returns how many went.
    fn remove_debits(&self, delivery_id: DeliveryId) -> RepoResult<usize>;
    fn balance_snapshots(&self) -> RepoResult<Vec<BalanceSnapshot>>;
    fn overwrite_balance(
        &self,
        user_id: &str,
        credit_type: CreditType,
        balance: i64,
        now: DateTime<Utc>,
    ) -> RepoResult<()>;
}

pub struct SqliteLedgerRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteLedgerRepository<'conn> {
    /// Constructs a repository from a migrated/ready connection.
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        ensure_tables_ready(
            conn,
            &[
                ("ledger_entries", LEDGER_ENTRY_COLUMNS),
                ("credit_balances", BALANCE_COLUMNS),
                ("delivery_debits", DEBIT_LINK_COLUMNS),
            ],
        )?;
        Ok(Self { conn })
    }
}

impl LedgerRepository for SqliteLedgerRepository<'_> {
    fn find_entry_by_key(&self, idempotency_key: &str) -> RepoResult<Option<LedgerEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "{LEDGER_SELECT_SQL} WHERE idempotency_key = ?1;"
        ))?;
        let mut rows = stmt.query([idempotency_key])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_entry_row(row)?));
        }
        Ok(None)
    }

    fn insert_entry(&self, entry: &LedgerEntry) -> RepoResult<()> {
        if entry.delta == 0 {
            return Err(RepoError::InvalidData(
                "ledger entry delta must not be zero".to_string(),
            ));
        }

        self.conn.execute(
            "INSERT INTO ledger_entries (
                entry_uuid,
                user_id,
                credit_type,
                delta,
                reason,
                related_delivery_uuid,
                idempotency_key,
                created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
            params![
                entry.id.to_string(),
                entry.user_id.as_str(),
                entry.credit_type.as_str(),
                entry.delta,
                entry.reason.as_str(),
                entry.related_delivery_id.map(|id| id.to_string()),
                entry.idempotency_key.as_deref(),
                to_epoch_ms(entry.created_at),
            ],
        )?;
        Ok(())
    }

    fn try_decrement_balance(
        &self,
        user_id: &str,
        credit_type: CreditType,
        amount: i64,
        now: DateTime<Utc>,
    ) -> RepoResult<bool> {
        let changed = self.conn.execute(
            "UPDATE credit_balances
             SET
                balance = balance - ?3,
                updated_at = ?4
             WHERE user_id = ?1
               AND credit_type = ?2
               AND balance >= ?3;",
            params![user_id, credit_type.as_str(), amount, to_epoch_ms(now)],
        )?;
        Ok(changed == 1)
    }

    fn increment_balance(
        &self,
        user_id: &str,
        credit_type: CreditType,
        amount: i64,
        now: DateTime<Utc>,
    ) -> RepoResult<()> {
        self.conn.execute(
            "INSERT INTO credit_balances (user_id, credit_type, balance, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (user_id, credit_type) DO UPDATE SET
                balance = balance + excluded.balance,
                updated_at = excluded.updated_at;",
            params![user_id, credit_type.as_str(), amount, to_epoch_ms(now)],
        )?;
        Ok(())
    }

    fn balance(&self, user_id: &str, credit_type: CreditType) -> RepoResult<i64> {
        let balance = self
            .conn
            .query_row(
                "SELECT balance
                 FROM credit_balances
                 WHERE user_id = ?1 AND credit_type = ?2;",
                params![user_id, credit_type.as_str()],
                |row| row.get::<_, i64>(0),
            )
            .optional()?;
        Ok(balance.unwrap_or(0))
    }

    fn entries_for_user(&self, user_id: &str) -> RepoResult<Vec<LedgerEntry>> {
        let mut stmt = self.conn.prepare(&format!(
            "{LEDGER_SELECT_SQL}
             WHERE user_id = ?1
             ORDER BY created_at ASC, rowid ASC;"
        ))?;
        let mut rows = stmt.query([user_id])?;
        let mut entries = Vec::new();
        while let Some(row) = rows.next()? {
            entries.push(parse_entry_row(row)?);
        }
        Ok(entries)
    }

    fn link_debit(&self, delivery_id: DeliveryId, debit: &CreditDebit) -> RepoResult<()> {
        self.conn.execute(
            "INSERT INTO delivery_debits (
                delivery_uuid,
                credit_type,
                amount,
                ledger_entry_uuid
            ) VALUES (?1, ?2, ?3, ?4);",
            params![
                delivery_id.to_string(),
                debit.credit_type.as_str(),
                debit.amount,
                debit.ledger_entry_id.to_string(),
            ],
        )?;
        Ok(())
    }

    fn debits_for_delivery(&self, delivery_id: DeliveryId) -> RepoResult<Vec<CreditDebit>> {
        load_debits(self.conn, delivery_id)
    }

    fn remove_debits(&self, delivery_id: DeliveryId) -> RepoResult<usize> {
        let removed = self.conn.execute(
            "DELETE FROM delivery_debits WHERE delivery_uuid = ?1;",
            [delivery_id.to_string()],
        )?;
        Ok(removed)
    }

    fn balance_snapshots(&self) -> RepoResult<Vec<BalanceSnapshot>> {
        let mut stmt = self.conn.prepare(
            "WITH derived AS (
                SELECT user_id, credit_type, SUM(delta) AS total
                FROM ledger_entries
                GROUP BY user_id, credit_type
             ),
             pairs AS (
                SELECT user_id, credit_type FROM derived
                UNION
                SELECT user_id, credit_type FROM credit_balances
             )
             SELECT
                p.user_id,
                p.credit_type,
                cb.balance AS cached,
                COALESCE(d.total, 0) AS derived
             FROM pairs p
             LEFT JOIN derived d
                ON d.user_id = p.user_id AND d.credit_type = p.credit_type
             LEFT JOIN credit_balances cb
                ON cb.user_id = p.user_id AND cb.credit_type = p.credit_type
             ORDER BY p.user_id ASC, p.credit_type ASC;",
        )?;
        let mut rows = stmt.query([])?;
        let mut snapshots = Vec::new();
        while let Some(row) = rows.next()? {
            let credit_type_text: String = row.get("credit_type")?;
            snapshots.push(BalanceSnapshot {
                user_id: row.get("user_id")?,
                credit_type: parse_credit_type(&credit_type_text, "credit_type")?,
                cached: row.get("cached")?,
                derived: row.get("derived")?,
            });
        }
        Ok(snapshots)
    }

    fn overwrite_balance(
        &self,
        user_id: &str,
        credit_type: CreditType,
        balance: i64,
        now: DateTime<Utc>,
    ) -> RepoResult<()> {
        self.conn.execute(
            "INSERT INTO credit_balances (user_id, credit_type, balance, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (user_id, credit_type) DO UPDATE SET
                balance = excluded.balance,
                updated_at = excluded.updated_at;",
            params![user_id, credit_type.as_str(), balance, to_epoch_ms(now)],
        )?;
        Ok(())
    }
}

/// Loads the debit links of one delivery; shared with the delivery repository.
pub(crate) fn load_debits(conn: &Connection, delivery_id: DeliveryId) -> RepoResult<Vec<CreditDebit>> {
    let mut stmt = conn.prepare(
        "SELECT credit_type, amount, ledger_entry_uuid
         FROM delivery_debits
         WHERE delivery_uuid = ?1
         ORDER BY credit_type ASC;",
    )?;
    let mut rows = stmt.query([delivery_id.to_string()])?;
    let mut debits = Vec::new();
    while let Some(row) = rows.next()? {
        let credit_type_text: String = row.get("credit_type")?;
        let entry_text: String = row.get("ledger_entry_uuid")?;
        debits.push(CreditDebit {
            credit_type: parse_credit_type(&credit_type_text, "delivery_debits.credit_type")?,
            amount: row.get("amount")?,
            ledger_entry_id: parse_uuid(&entry_text, "delivery_debits.ledger_entry_uuid")?,
        });
    }
    Ok(debits)
}

fn parse_entry_row(row: &Row<'_>) -> RepoResult<LedgerEntry> {
    let id_text: String = row.get("entry_uuid")?;
    let credit_type_text: String = row.get("credit_type")?;
    let reason_text: String = row.get("reason")?;
    let related = match row.get::<_, Option<String>>("related_delivery_uuid")? {
        Some(value) => Some(parse_uuid(&value, "ledger_entries.related_delivery_uuid")?),
        None => None,
    };

    Ok(LedgerEntry {
        id: parse_uuid(&id_text, "ledger_entries.entry_uuid")?,
        user_id: row.get("user_id")?,
        credit_type: parse_credit_type(&credit_type_text, "ledger_entries.credit_type")?,
        delta: row.get("delta")?,
        reason: LedgerReason::parse(&reason_text).ok_or_else(|| {
            RepoError::InvalidData(format!(
                "invalid reason `{reason_text}` in ledger_entries.reason"
            ))
        })?,
        related_delivery_id: related,
        idempotency_key: row.get("idempotency_key")?,
        created_at: parse_instant(row.get("created_at")?, "ledger_entries.created_at")?,
    })
}

fn parse_credit_type(value: &str, column: &str) -> RepoResult<CreditType> {
    CreditType::parse(value).ok_or_else(|| {
        RepoError::InvalidData(format!("invalid credit type `{value}` in {column}"))
    })
}
