//! Letter use-case service.
//!
//! # Invariants
//! - Every operation is scoped to the calling owner; foreign letters are
//!   reported as not found.
//! - Sealed letters reject edits with `LetterSealed`.

use crate::model::letter::{Letter, LetterId};
use crate::repo::letter_repo::{LetterRepository, SqliteLetterRepository};
use crate::repo::RepoError;
use crate::time::Clock;
use log::info;
use rusqlite::Connection;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LetterServiceError {
    #[error("letter not found: {0}")]
    NotFound(LetterId),
    #[error("letter {0} is sealed and can no longer be edited")]
    LetterSealed(LetterId),
    #[error(transparent)]
    Repo(#[from] RepoError),
}

pub struct LetterService<'conn, C: Clock> {
    conn: &'conn Connection,
    clock: C,
}

impl<'conn, C: Clock> LetterService<'conn, C> {
    pub fn new(conn: &'conn Connection, clock: C) -> Self {
        Self { conn, clock }
    }

    pub fn create_letter(
        &self,
        owner_id: &str,
        title: &str,
        content_handle: &str,
    ) -> Result<Letter, LetterServiceError> {
        let letter = Letter::new_draft(owner_id.trim(), title, content_handle, self.clock.now());
        SqliteLetterRepository::try_new(self.conn)?.create_letter(&letter)?;
        info!(
            "event=letter_create module=letter status=ok letter_id={}",
            letter.id
        );
        Ok(letter)
    }

    pub fn get_letter(&self, owner_id: &str, id: LetterId) -> Result<Letter, LetterServiceError> {
        owned_letter(self.conn, owner_id, id)
    }

    pub fn list_letters(&self, owner_id: &str) -> Result<Vec<Letter>, LetterServiceError> {
        Ok(SqliteLetterRepository::try_new(self.conn)?.list_letters_for_owner(owner_id)?)
    }

    /// Replaces title and content handle of a draft letter.
    pub fn update_letter(
        &self,
        owner_id: &str,
        id: LetterId,
        title: &str,
        content_handle: &str,
    ) -> Result<Letter, LetterServiceError> {
        let mut letter = owned_letter(self.conn, owner_id, id)?;
        if letter.sealed {
            return Err(LetterServiceError::LetterSealed(id));
        }

        letter.title = title.trim().to_string();
        letter.content_handle = content_handle.trim().to_string();
        letter.updated_at = self.clock.now();
        letter.validate().map_err(RepoError::from)?;

        SqliteLetterRepository::try_new(self.conn)?.update_draft(
            id,
            &letter.title,
            &letter.content_handle,
            letter.updated_at,
        )?;
        Ok(letter)
    }
}

/// Loads a live letter owned by `owner_id`.
pub(crate) fn owned_letter(
    conn: &Connection,
    owner_id: &str,
    id: LetterId,
) -> Result<Letter, LetterServiceError> {
    SqliteLetterRepository::try_new(conn)?
        .get_letter(id, false)?
        .filter(|letter| letter.owner_id == owner_id)
        .ok_or(LetterServiceError::NotFound(id))
}
