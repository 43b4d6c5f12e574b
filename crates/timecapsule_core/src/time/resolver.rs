//! Local wall time to absolute instant resolution.
//!
//! # Responsibility
//! - Resolve `{date, time, IANA zone}` into a UTC instant using the full
//!   timezone database, never a fixed offset.
//! - Render stored instants back into a viewer's zone.
//!
//! # Invariants
//! - A wall time inside a spring-forward gap is rejected, never shifted.
//! - A wall time inside a fall-back overlap resolves to the earlier instant
//!   unless the caller supplies the UTC offset it meant.
//! - Resolution is a pure function of its inputs and the bundled tz database.

use chrono::{
    DateTime, FixedOffset, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, Offset, TimeZone,
    Utc,
};
use chrono_tz::Tz;
use thiserror::Error;

/// User-submitted local delivery time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTimeRequest {
    pub date: NaiveDate,
    pub time: NaiveTime,
    /// IANA zone name, e.g. `America/New_York`.
    pub zone: String,
    /// Explicit UTC offset used only to pick one side of a fall-back overlap.
    pub offset_hint: Option<FixedOffset>,
}

impl LocalTimeRequest {
    pub fn new(date: NaiveDate, time: NaiveTime, zone: impl Into<String>) -> Self {
        Self {
            date,
            time,
            zone: zone.into(),
            offset_hint: None,
        }
    }

    /// Attaches an offset disambiguator for overlapping wall times.
    pub fn with_offset_hint(mut self, offset: FixedOffset) -> Self {
        self.offset_hint = Some(offset);
        self
    }

    pub fn naive(&self) -> NaiveDateTime {
        self.date.and_time(self.time)
    }

    /// Resolves this request into an absolute instant.
    pub fn resolve(&self) -> Result<DateTime<Utc>, ResolveError> {
        resolve_local_time(self.date, self.time, &self.zone, self.offset_hint)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("unknown IANA timezone `{0}`")]
    InvalidTimezone(String),
    #[error("local time {local} does not exist in {zone} (daylight saving gap)")]
    NonexistentLocalTime { local: NaiveDateTime, zone: String },
    #[error("local time {local} is ambiguous in {zone} and offset {offset} matches neither instant")]
    AmbiguousLocalTime {
        local: NaiveDateTime,
        zone: String,
        offset: FixedOffset,
    },
}

/// Parses an IANA zone name.
pub fn parse_zone(name: &str) -> Result<Tz, ResolveError> {
    let trimmed = name.trim();
    trimmed
        .parse::<Tz>()
        .map_err(|_| ResolveError::InvalidTimezone(trimmed.to_string()))
}

/// Resolves a local date/time in `zone` into a UTC instant.
///
/// # Errors
/// - `InvalidTimezone` when `zone` is not an IANA identifier.
/// - `NonexistentLocalTime` when the wall time is skipped by a DST transition.
/// - `AmbiguousLocalTime` when the wall time repeats and `offset_hint` matches
///   neither occurrence.
pub fn resolve_local_time(
    date: NaiveDate,
    time: NaiveTime,
    zone: &str,
    offset_hint: Option<FixedOffset>,
) -> Result<DateTime<Utc>, ResolveError> {
    let tz = parse_zone(zone)?;
    let local = date.and_time(time);

    match tz.from_local_datetime(&local) {
        LocalResult::Single(instant) => Ok(instant.with_timezone(&Utc)),
        LocalResult::Ambiguous(first, second) => {
            let (earlier, later) = if first <= second {
                (first, second)
            } else {
                (second, first)
            };
            match offset_hint {
                None => Ok(earlier.with_timezone(&Utc)),
                Some(offset) if earlier.offset().fix() == offset => {
                    Ok(earlier.with_timezone(&Utc))
                }
                Some(offset) if later.offset().fix() == offset => Ok(later.with_timezone(&Utc)),
                Some(offset) => Err(ResolveError::AmbiguousLocalTime {
                    local,
                    zone: tz.name().to_string(),
                    offset,
                }),
            }
        }
        LocalResult::None => Err(ResolveError::NonexistentLocalTime {
            local,
            zone: tz.name().to_string(),
        }),
    }
}

/// Renders `instant` in `zone` for display.
pub fn to_local(instant: DateTime<Utc>, zone: &str) -> Result<DateTime<Tz>, ResolveError> {
    let tz = parse_zone(zone)?;
    Ok(instant.with_timezone(&tz))
}
