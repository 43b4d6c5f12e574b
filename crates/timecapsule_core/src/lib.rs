//! Core engine for scheduling and delivering sealed future letters.
//! This crate is the single source of truth for delivery, ledger and reveal
//! invariants.

pub mod config;
pub mod db;
pub mod lifecycle;
pub mod logging;
pub mod model;
pub mod policy;
pub mod provider;
pub mod repo;
pub mod service;
pub mod time;

pub use config::{ConfigError, DispatchConfig, EngineConfig, LoggingConfig, RetryConfig};
pub use db::{open_db, open_db_in_memory, DbError};
pub use lifecycle::{FailureDisposition, LifecycleEvent, Transition, TransitionError};
pub use logging::{
    default_log_level, init_logging, init_logging_from_config, logging_status, LoggingError,
};
pub use model::delivery::{
    Channel, Delivery, DeliveryId, DeliveryStatus, MailingAddress, Recipient, TimingMode,
};
pub use model::ledger::{CreditBalances, CreditType, LedgerEntry, LedgerReason};
pub use model::letter::{Letter, LetterId};
pub use policy::{MailClass, PolicyConfig, PolicyEngine, PolicyViolation};
pub use provider::{
    DryRunProvider, ProviderRegistry, SendError, SendProvider, SendReceipt, SendRequest,
};
pub use repo::{RepoError, RepoResult};
pub use rusqlite::Connection;
pub use service::{
    DeliveryService, DeliveryServiceError, DispatchScheduler, LedgerService, LetterService,
    ReadModelService, RevealGate, ScheduleRequest,
};
pub use time::{Clock, LocalTimeRequest, ManualClock, ResolveError, SystemClock};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
