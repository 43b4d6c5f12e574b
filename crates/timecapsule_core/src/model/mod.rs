//! Domain model for letters, deliveries and the credit ledger.
//!
//! # Responsibility
//! - Define canonical data structures used by core business logic.
//! - Keep closed enums for every value the engine branches on.
//!
//! # Invariants
//! - Every domain object is identified by a stable UUID.
//! - Letters and deliveries are tombstoned, never hard-deleted.
//! - Ledger entries are append-only.

pub mod delivery;
pub mod ledger;
pub mod letter;
