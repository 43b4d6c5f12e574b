//! Use-case services.
//!
//! # Responsibility
//! - Orchestrate repository calls and lifecycle transitions into
//!   owner-facing and worker-facing APIs.
//! - Own transaction boundaries; repositories never open transactions.

pub mod delivery_service;
pub mod dispatch_service;
pub mod ledger_service;
pub mod letter_service;
pub mod read_model;
pub mod reveal_service;

pub use delivery_service::{DeliveryService, DeliveryServiceError, ScheduleRequest};
pub use dispatch_service::{
    compute_backoff, DispatchError, DispatchOutcome, DispatchScheduler, TickReport,
};
pub use ledger_service::{
    DebitRequest, LedgerError, LedgerService, ReconcileReport, RefundOutcome,
};
pub use letter_service::{LetterService, LetterServiceError};
pub use read_model::{DeliveryView, ReadModelError, ReadModelService};
pub use reveal_service::{can_reveal, RevealDecision, RevealGate};
