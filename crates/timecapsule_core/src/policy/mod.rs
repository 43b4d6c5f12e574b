//! Temporal policy windows for scheduling and cancellation.
//!
//! # Responsibility
//! - Decide whether a send instant is inside the allowed scheduling window.
//! - Decide whether a delivery may still be canceled.
//! - Convert between send and arrival instants for physical mail.
//!
//! # Invariants
//! - Every check is a pure function of its arguments and [`PolicyConfig`].
//! - Lead, horizon and advance-notice bounds are inclusive; the cancellation
//!   cutoff is strict, so exactly `cancellation_cutoff_hours` before send is
//!   already too late.
//! - Business-day walks run on the UTC calendar, keep the time of day and
//!   count Monday through Friday only.
//! - Walks longer than `max_transit_days` are refused before any date
//!   arithmetic, and every step is overflow-checked.

pub mod transit;

use chrono::{DateTime, Datelike, Duration, Months, Utc, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use transit::{DestinationRegion, MailClass, TransitEstimate, TransitEstimator};

/// Policy thresholds. Defaults match the product rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub min_lead_minutes: i64,
    pub max_horizon_years: u32,
    pub cancellation_cutoff_hours: i64,
    pub arrive_by_min_days: i64,
    /// Upper bound on business days of mail transit.
    pub max_transit_days: u32,
    /// Country treated as domestic by the transit estimator.
    pub home_country: String,
    pub default_mail_class: MailClass,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            min_lead_minutes: 5,
            max_horizon_years: 100,
            cancellation_cutoff_hours: 72,
            arrive_by_min_days: 30,
            max_transit_days: 60,
            home_country: "US".to_string(),
            default_mail_class: MailClass::FirstClass,
        }
    }
}

/// Reason a request falls outside a policy window.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyViolation {
    #[error("send time must be at least {min_minutes} minutes in the future")]
    LeadTimeTooShort { min_minutes: i64 },
    #[error("send time must be within {max_years} years")]
    HorizonTooFar { max_years: u32 },
    #[error("cancellation closes {cutoff_hours} hours before the send time")]
    TooLateToCancel { cutoff_hours: i64 },
    #[error("requested arrival cannot be met: computed send time {computed_send_at} is not in the future")]
    ArrivalUnreachable { computed_send_at: DateTime<Utc> },
    #[error("arrive-by delivery requires at least {min_days} days notice")]
    AdvanceNoticeTooShort { min_days: i64 },
    #[error("mail transit of {requested} business days exceeds the {max_days} day limit")]
    TransitTooLong { requested: u32, max_days: u32 },
}

impl PolicyViolation {
    /// Stable machine-readable reason code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::LeadTimeTooShort { .. } => "lead_time_too_short",
            Self::HorizonTooFar { .. } => "horizon_too_far",
            Self::TooLateToCancel { .. } => "too_late_to_cancel",
            Self::ArrivalUnreachable { .. } => "arrival_unreachable",
            Self::AdvanceNoticeTooShort { .. } => "advance_notice_too_short",
            Self::TransitTooLong { .. } => "transit_too_long",
        }
    }
}

pub type PolicyResult<T> = Result<T, PolicyViolation>;

#[derive(Debug, Clone, Default)]
pub struct PolicyEngine {
    config: PolicyConfig,
}

impl PolicyEngine {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Transit estimator configured with this policy's home country.
    pub fn transit_estimator(&self) -> TransitEstimator {
        TransitEstimator::new(self.config.home_country.as_str())
    }

    pub fn min_lead(&self, now: DateTime<Utc>, send_at: DateTime<Utc>) -> PolicyResult<()> {
        if send_at - now >= Duration::minutes(self.config.min_lead_minutes) {
            Ok(())
        } else {
            Err(PolicyViolation::LeadTimeTooShort {
                min_minutes: self.config.min_lead_minutes,
            })
        }
    }

    pub fn max_horizon(&self, now: DateTime<Utc>, send_at: DateTime<Utc>) -> PolicyResult<()> {
        let months = self.config.max_horizon_years.saturating_mul(12);
        match now.checked_add_months(Months::new(months)) {
            Some(limit) if send_at > limit => Err(PolicyViolation::HorizonTooFar {
                max_years: self.config.max_horizon_years,
            }),
            _ => Ok(()),
        }
    }

    /// Runs the scheduling window checks in order: lead first, then horizon.
    pub fn scheduling_window(
        &self,
        now: DateTime<Utc>,
        send_at: DateTime<Utc>,
    ) -> PolicyResult<()> {
        self.min_lead(now, send_at)?;
        self.max_horizon(now, send_at)
    }

    pub fn cancellation_cutoff(
        &self,
        now: DateTime<Utc>,
        send_at: DateTime<Utc>,
    ) -> PolicyResult<()> {
        if send_at - now > Duration::hours(self.config.cancellation_cutoff_hours) {
            Ok(())
        } else {
            Err(PolicyViolation::TooLateToCancel {
                cutoff_hours: self.config.cancellation_cutoff_hours,
            })
        }
    }

    /// Last instant at which a cancel request is still refused.
    ///
    /// Cancels strictly before this instant succeed.
    pub fn cancellation_deadline(&self, send_at: DateTime<Utc>) -> DateTime<Utc> {
        send_at - Duration::hours(self.config.cancellation_cutoff_hours)
    }

    pub fn arrive_by_advance(
        &self,
        now: DateTime<Utc>,
        arrive_at: DateTime<Utc>,
    ) -> PolicyResult<()> {
        if arrive_at - now >= Duration::days(self.config.arrive_by_min_days) {
            Ok(())
        } else {
            Err(PolicyViolation::AdvanceNoticeTooShort {
                min_days: self.config.arrive_by_min_days,
            })
        }
    }

    /// Counts `transit_days` business days back from `arrive_at`.
    ///
    /// # Errors
    /// - `TransitTooLong` above `max_transit_days`.
    /// - `ArrivalUnreachable` when the computed send instant is not strictly
    ///   after `now`, or falls before the representable calendar.
    pub fn compute_send_from_arrival(
        &self,
        now: DateTime<Utc>,
        arrive_at: DateTime<Utc>,
        transit_days: u32,
    ) -> PolicyResult<DateTime<Utc>> {
        self.transit_limit(transit_days)?;
        match walk_business_days(arrive_at, transit_days, -1) {
            Some(send_at) if send_at > now => Ok(send_at),
            Some(send_at) => Err(PolicyViolation::ArrivalUnreachable {
                computed_send_at: send_at,
            }),
            None => Err(PolicyViolation::ArrivalUnreachable {
                computed_send_at: DateTime::<Utc>::MIN_UTC,
            }),
        }
    }

    /// Counts `transit_days` business days forward from `send_at`.
    ///
    /// # Errors
    /// - `TransitTooLong` above `max_transit_days`.
    /// - `HorizonTooFar` when the arrival leaves the representable calendar.
    pub fn compute_arrival_from_send(
        &self,
        send_at: DateTime<Utc>,
        transit_days: u32,
    ) -> PolicyResult<DateTime<Utc>> {
        self.transit_limit(transit_days)?;
        walk_business_days(send_at, transit_days, 1).ok_or(PolicyViolation::HorizonTooFar {
            max_years: self.config.max_horizon_years,
        })
    }

    fn transit_limit(&self, transit_days: u32) -> PolicyResult<()> {
        if transit_days > self.config.max_transit_days {
            return Err(PolicyViolation::TransitTooLong {
                requested: transit_days,
                max_days: self.config.max_transit_days,
            });
        }
        Ok(())
    }
}

fn walk_business_days(
    start: DateTime<Utc>,
    business_days: u32,
    step_days: i64,
) -> Option<DateTime<Utc>> {
    let step = Duration::days(step_days);
    let mut cursor = start;
    let mut counted = 0;
    while counted < business_days {
        cursor = cursor.checked_add_signed(step)?;
        if is_business_day(cursor.weekday()) {
            counted += 1;
        }
    }
    Some(cursor)
}

fn is_business_day(day: Weekday) -> bool {
    !matches!(day, Weekday::Sat | Weekday::Sun)
}
