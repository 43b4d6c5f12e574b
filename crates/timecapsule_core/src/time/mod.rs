//! Time sources and local-time resolution.
//!
//! # Responsibility
//! - Replace ambient wall-clock reads with an injected [`Clock`].
//! - Convert user-local wall times into absolute UTC instants.

pub mod clock;
pub mod resolver;

pub use clock::{Clock, ManualClock, SystemClock};
pub use resolver::{parse_zone, resolve_local_time, to_local, LocalTimeRequest, ResolveError};
