//! Repository layer abstractions and persistence implementations.
//!
//! # Responsibility
//! - Define use-case oriented data access contracts.
//! - Isolate SQLite query details from service/business orchestration.
//!
//! # Invariants
//! - Repositories never open transactions; callers own transaction scope so
//!   several repositories can share one atomic write.
//! - Repository APIs return semantic errors (`NotFound`, `StaleState`) in
//!   addition to DB transport errors.
//! - Read paths reject invalid persisted state instead of masking it.

pub mod delivery_repo;
pub mod ledger_repo;
pub mod letter_repo;

use crate::db::{from_epoch_ms, migrations, DbError};
use crate::model::letter::LetterValidationError;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode};
use thiserror::Error;
use uuid::Uuid;

pub type RepoResult<T> = Result<T, RepoError>;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Validation(#[from] LetterValidationError),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("delivery {id} changed concurrently (expected version {expected_version})")]
    StaleState { id: Uuid, expected_version: i64 },
    #[error("letter {letter_id} already has an active delivery")]
    ActiveDeliveryExists { letter_id: Uuid },
    #[error("invalid persisted data: {0}")]
    InvalidData(String),
    #[error("required table `{0}` is missing")]
    MissingRequiredTable(&'static str),
    #[error("required column `{table}.{column}` is missing")]
    MissingRequiredColumn {
        table: &'static str,
        column: &'static str,
    },
    #[error("schema version {found} is older than required {required}")]
    SchemaNotReady { found: u32, required: u32 },
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Verifies migrations ran and the given tables carry the given columns.
pub(crate) fn ensure_tables_ready(
    conn: &Connection,
    tables: &[(&'static str, &[&'static str])],
) -> RepoResult<()> {
    let found = migrations::current_user_version(conn)?;
    let required = migrations::latest_version();
    if found < required {
        return Err(RepoError::SchemaNotReady { found, required });
    }

    for &(table, columns) in tables {
        if !table_exists(conn, table)? {
            return Err(RepoError::MissingRequiredTable(table));
        }
        for &column in columns {
            if !table_has_column(conn, table, column)? {
                return Err(RepoError::MissingRequiredColumn { table, column });
            }
        }
    }

    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> RepoResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(
            SELECT 1
            FROM sqlite_master
            WHERE type = 'table' AND name = ?1
        );",
        [table],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> RepoResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table});"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let current: String = row.get(1)?;
        if current == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub(crate) fn parse_uuid(value: &str, column: &str) -> RepoResult<Uuid> {
    Uuid::parse_str(value)
        .map_err(|_| RepoError::InvalidData(format!("invalid uuid value `{value}` in {column}")))
}

pub(crate) fn parse_instant(value: i64, column: &str) -> RepoResult<DateTime<Utc>> {
    from_epoch_ms(value).ok_or_else(|| {
        RepoError::InvalidData(format!("timestamp `{value}` out of range in {column}"))
    })
}

pub(crate) fn parse_optional_instant(
    value: Option<i64>,
    column: &str,
) -> RepoResult<Option<DateTime<Utc>>> {
    value.map(|raw| parse_instant(raw, column)).transpose()
}

pub(crate) fn parse_bool(value: i64, column: &str) -> RepoResult<bool> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(RepoError::InvalidData(format!(
            "invalid boolean value `{other}` in {column}"
        ))),
    }
}

pub(crate) fn bool_to_int(value: bool) -> i64 {
    if value {
        1
    } else {
        0
    }
}

/// Whether `err` is a UNIQUE index violation.
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == ErrorCode::ConstraintViolation
                && inner.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}
