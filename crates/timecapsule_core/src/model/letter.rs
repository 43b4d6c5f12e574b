//! Letter domain model.
//!
//! # Responsibility
//! - Describe the sealed-or-draft letter a delivery carries.
//!
//! # Invariants
//! - `content_handle` is an opaque reference into the external content store.
//! - Once `sealed`, `title` and `content_handle` never change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Stable letter identifier.
pub type LetterId = Uuid;

/// Identity-provider user id. Trusted as already authenticated.
pub type UserId = String;

const TITLE_MAX_CHARS: usize = 200;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LetterValidationError {
    #[error("letter title must not be blank")]
    BlankTitle,
    #[error("letter title exceeds {TITLE_MAX_CHARS} characters")]
    TitleTooLong,
    #[error("letter content handle must not be blank")]
    BlankContentHandle,
    #[error("letter owner must not be blank")]
    BlankOwner,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Letter {
    pub id: LetterId,
    pub owner_id: UserId,
    pub title: String,
    pub content_handle: String,
    pub sealed: bool,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Letter {
    /// Creates a new unsealed draft letter.
    pub fn new_draft(
        owner_id: impl Into<UserId>,
        title: impl Into<String>,
        content_handle: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id: owner_id.into(),
            title: title.into().trim().to_string(),
            content_handle: content_handle.into().trim().to_string(),
            sealed: false,
            is_deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn validate(&self) -> Result<(), LetterValidationError> {
        if self.owner_id.trim().is_empty() {
            return Err(LetterValidationError::BlankOwner);
        }
        if self.title.trim().is_empty() {
            return Err(LetterValidationError::BlankTitle);
        }
        if self.title.chars().count() > TITLE_MAX_CHARS {
            return Err(LetterValidationError::TitleTooLong);
        }
        if self.content_handle.trim().is_empty() {
            return Err(LetterValidationError::BlankContentHandle);
        }
        Ok(())
    }

    /// Whether the letter is still editable.
    pub fn is_editable(&self) -> bool {
        !self.sealed && !self.is_deleted
    }
}
