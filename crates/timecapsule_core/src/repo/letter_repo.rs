//! Letter repository contracts and SQLite implementation.
//!
//! # Invariants
//! - Write paths call `Letter::validate()` before SQL mutations.
//! - Sealed letters never change title or content handle.
//! - Owner-scoped reads treat foreign rows as absent.

use crate::db::to_epoch_ms;
use crate::model::letter::{Letter, LetterId};
use crate::repo::{
    bool_to_int, ensure_tables_ready, parse_bool, parse_instant, parse_uuid, RepoError,
    RepoResult,
};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

const LETTER_SELECT_SQL: &str = "SELECT
    letter_uuid,
    owner_id,
    title,
    content_handle,
    is_sealed,
    is_deleted,
    created_at,
    updated_at
FROM letters";

const LETTER_COLUMNS: &[&str] = &[
    "letter_uuid",
    "owner_id",
    "title",
    "content_handle",
    "is_sealed",
    "is_deleted",
];

pub trait LetterRepository {
    fn create_letter(&self, letter: &Letter) -> RepoResult<LetterId>;
    fn get_letter(&self, id: LetterId, include_deleted: bool) -> RepoResult<Option<Letter>>;
    fn list_letters_for_owner(&self, owner_id: &str) -> RepoResult<Vec<Letter>>;
    /// Replaces title and content of an unsealed letter.
    fn update_draft(
        &self,
        id: LetterId,
        title: &str,
        content_handle: &str,
        now: DateTime<Utc>,
    ) -> RepoResult<()>;
    /// Marks the letter sealed. Returns `false` when it was already sealed.
    fn seal_letter(&self, id: LetterId, now: DateTime<Utc>) -> RepoResult<bool>;
    fn soft_delete_letter(&self, id: LetterId, now: DateTime<Utc>) -> RepoResult<()>;
}

pub struct SqliteLetterRepository<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteLetterRepository<'conn> {
    /// Constructs a repository from a migrated/ready connection.
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        ensure_tables_ready(conn, &[("letters", LETTER_COLUMNS)])?;
        Ok(Self { conn })
    }
}

impl LetterRepository for SqliteLetterRepository<'_> {
    fn create_letter(&self, letter: &Letter) -> RepoResult<LetterId> {
        letter.validate()?;

        self.conn.execute(
            "INSERT INTO letters (
                letter_uuid,
                owner_id,
                title,
                content_handle,
                is_sealed,
                is_deleted,
                created_at,
                updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8);",
            params![
                letter.id.to_string(),
                letter.owner_id.as_str(),
                letter.title.as_str(),
                letter.content_handle.as_str(),
                bool_to_int(letter.sealed),
                bool_to_int(letter.is_deleted),
                to_epoch_ms(letter.created_at),
                to_epoch_ms(letter.updated_at),
            ],
        )?;

        Ok(letter.id)
    }

    fn get_letter(&self, id: LetterId, include_deleted: bool) -> RepoResult<Option<Letter>> {
        let mut stmt = self.conn.prepare(&format!(
            "{LETTER_SELECT_SQL}
             WHERE letter_uuid = ?1
               AND (?2 = 1 OR is_deleted = 0);"
        ))?;

        let mut rows = stmt.query(params![id.to_string(), bool_to_int(include_deleted)])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_letter_row(row)?));
        }

        Ok(None)
    }

    fn list_letters_for_owner(&self, owner_id: &str) -> RepoResult<Vec<Letter>> {
        let mut stmt = self.conn.prepare(&format!(
            "{LETTER_SELECT_SQL}
             WHERE owner_id = ?1
               AND is_deleted = 0
             ORDER BY updated_at DESC, letter_uuid ASC;"
        ))?;
        let mut rows = stmt.query([owner_id])?;
        let mut letters = Vec::new();
        while let Some(row) = rows.next()? {
            letters.push(parse_letter_row(row)?);
        }
        Ok(letters)
    }

    fn update_draft(
        &self,
        id: LetterId,
        title: &str,
        content_handle: &str,
        now: DateTime<Utc>,
    ) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE letters
             SET
                title = ?2,
                content_handle = ?3,
                updated_at = ?4
             WHERE letter_uuid = ?1
               AND is_sealed = 0
               AND is_deleted = 0;",
            params![id.to_string(), title, content_handle, to_epoch_ms(now)],
        )?;

        if changed == 0 {
            return Err(RepoError::NotFound {
                entity: "editable letter",
                id,
            });
        }

        Ok(())
    }

    fn seal_letter(&self, id: LetterId, now: DateTime<Utc>) -> RepoResult<bool> {
        let changed = self.conn.execute(
            "UPDATE letters
             SET
                is_sealed = 1,
                updated_at = ?2
             WHERE letter_uuid = ?1
               AND is_sealed = 0
               AND is_deleted = 0;",
            params![id.to_string(), to_epoch_ms(now)],
        )?;
        Ok(changed == 1)
    }

    fn soft_delete_letter(&self, id: LetterId, now: DateTime<Utc>) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE letters
             SET
                is_deleted = 1,
                updated_at = ?2
             WHERE letter_uuid = ?1
               AND is_deleted = 0;",
            params![id.to_string(), to_epoch_ms(now)],
        )?;

        if changed == 0 {
            return Err(RepoError::NotFound {
                entity: "letter",
                id,
            });
        }

        Ok(())
    }
}

fn parse_letter_row(row: &Row<'_>) -> RepoResult<Letter> {
    let id_text: String = row.get("letter_uuid")?;
    let letter = Letter {
        id: parse_uuid(&id_text, "letters.letter_uuid")?,
        owner_id: row.get("owner_id")?,
        title: row.get("title")?,
        content_handle: row.get("content_handle")?,
        sealed: parse_bool(row.get("is_sealed")?, "letters.is_sealed")?,
        is_deleted: parse_bool(row.get("is_deleted")?, "letters.is_deleted")?,
        created_at: parse_instant(row.get("created_at")?, "letters.created_at")?,
        updated_at: parse_instant(row.get("updated_at")?, "letters.updated_at")?,
    };
    letter.validate()?;
    Ok(letter)
}
