//! SQLite storage bootstrap and schema migration entry points.
//!
//! # Responsibility
//! - Open and configure SQLite connections for the delivery engine.
//! - Apply schema migrations in deterministic order.
//! - Provide the epoch-millisecond codec shared by all repositories.
//!
//! # Invariants
//! - Migration version is tracked via `PRAGMA user_version`.
//! - Core code must not read/write application data before migrations succeed.
//! - Every timestamp column stores UTC epoch milliseconds.

use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;

pub mod migrations;
mod open;

pub use open::{open_db, open_db_in_memory};

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("{0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database schema version {db_version} is newer than supported {latest_supported}")]
    UnsupportedSchemaVersion {
        db_version: u32,
        latest_supported: u32,
    },
}

/// Converts an instant into the epoch-millisecond storage form.
pub fn to_epoch_ms(instant: DateTime<Utc>) -> i64 {
    instant.timestamp_millis()
}

/// Converts a stored epoch-millisecond value back into an instant.
///
/// Returns `None` for values outside chrono's representable range.
pub fn from_epoch_ms(value: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(value).single()
}
