//! Injected clock abstraction.
//!
//! # Invariants
//! - Engine code reads "now" only through [`Clock::now`].
//! - [`ManualClock`] clones share one time cell, so a test can advance the
//!   clock observed by every worker at once.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Source of the current instant.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time source used in production.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Controllable time source with millisecond resolution.
#[derive(Debug, Clone)]
pub struct ManualClock {
    epoch_ms: Arc<AtomicI64>,
}

impl ManualClock {
    /// Creates a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            epoch_ms: Arc::new(AtomicI64::new(start.timestamp_millis())),
        }
    }

    /// Moves the clock forward (or backward for negative durations).
    pub fn advance(&self, by: Duration) {
        self.epoch_ms
            .fetch_add(by.num_milliseconds(), Ordering::SeqCst);
    }

    /// Jumps the clock to `instant`.
    pub fn set(&self, instant: DateTime<Utc>) {
        self.epoch_ms
            .store(instant.timestamp_millis(), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        let ms = self.epoch_ms.load(Ordering::SeqCst);
        Utc.timestamp_millis_opt(ms)
            .single()
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}
