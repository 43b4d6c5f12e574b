//! Carrier transit estimates for physical mail.
//!
//! Used when the mail provider does not quote transit days itself.
//!
//! # Invariants
//! - International destinations always ship first class.
//! - Unknown or missing country codes are treated per `home_country`
//!   (missing = domestic, unknown = other).

use serde::{Deserialize, Serialize};

const EARLY_ARRIVAL_DAYS: u32 = 2;
const INTERNATIONAL_EXTRA_BUFFER_DAYS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MailClass {
    #[default]
    FirstClass,
    Standard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationRegion {
    Domestic,
    NorthAmerica,
    Europe,
    AsiaPacific,
    Other,
}

impl DestinationRegion {
    fn extra_transit_days(self) -> u32 {
        match self {
            Self::Domestic => 0,
            Self::NorthAmerica => 5,
            Self::Europe => 7,
            Self::AsiaPacific => 10,
            Self::Other => 12,
        }
    }
}

/// Business-day estimate for one mail piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitEstimate {
    pub mail_class: MailClass,
    pub region: DestinationRegion,
    pub transit_days: u32,
    pub buffer_days: u32,
    pub early_arrival_days: u32,
}

impl TransitEstimate {
    /// Business days to count back from the requested arrival.
    pub fn total_lead_days(&self) -> u32 {
        self.transit_days + self.buffer_days + self.early_arrival_days
    }
}

/// Static transit table keyed by mail class and destination region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitEstimator {
    home_country: String,
}

impl Default for TransitEstimator {
    fn default() -> Self {
        Self::new("US")
    }
}

impl TransitEstimator {
    pub fn new(home_country: impl Into<String>) -> Self {
        Self {
            home_country: home_country.into().trim().to_ascii_uppercase(),
        }
    }

    pub fn region_for(&self, country_code: Option<&str>) -> DestinationRegion {
        let normalized = match country_code.map(|code| code.trim().to_ascii_uppercase()) {
            Some(code) if !code.is_empty() => code,
            _ => return DestinationRegion::Domestic,
        };
        if normalized == self.home_country {
            return DestinationRegion::Domestic;
        }
        match normalized.as_str() {
            "US" | "CA" | "MX" => DestinationRegion::NorthAmerica,
            "GB" | "UK" | "DE" | "FR" | "IT" | "ES" | "NL" | "BE" | "AT" | "CH" | "IE" | "PT"
            | "SE" | "NO" | "DK" | "FI" | "PL" => DestinationRegion::Europe,
            "AU" | "NZ" | "JP" | "KR" | "SG" | "HK" | "TW" => DestinationRegion::AsiaPacific,
            _ => DestinationRegion::Other,
        }
    }

    pub fn estimate(&self, requested: MailClass, country_code: Option<&str>) -> TransitEstimate {
        let region = self.region_for(country_code);
        let international = region != DestinationRegion::Domestic;
        let mail_class = if international {
            MailClass::FirstClass
        } else {
            requested
        };
        let (base_transit, base_buffer) = match mail_class {
            MailClass::FirstClass => (5, 3),
            MailClass::Standard => (8, 4),
        };
        let international_buffer = if international {
            INTERNATIONAL_EXTRA_BUFFER_DAYS
        } else {
            0
        };

        TransitEstimate {
            mail_class,
            region,
            transit_days: base_transit + region.extra_transit_days(),
            buffer_days: base_buffer + international_buffer,
            early_arrival_days: EARLY_ARRIVAL_DAYS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DestinationRegion, MailClass, TransitEstimator};

    #[test]
    fn domestic_standard_keeps_requested_class() {
        let estimator = TransitEstimator::default();
        let estimate = estimator.estimate(MailClass::Standard, Some("us"));
        assert_eq!(estimate.region, DestinationRegion::Domestic);
        assert_eq!(estimate.mail_class, MailClass::Standard);
        assert_eq!(estimate.total_lead_days(), 8 + 4 + 2);
    }

    #[test]
    fn international_forces_first_class_and_adds_region_days() {
        let estimator = TransitEstimator::default();
        let estimate = estimator.estimate(MailClass::Standard, Some("DE"));
        assert_eq!(estimate.mail_class, MailClass::FirstClass);
        assert_eq!(estimate.region, DestinationRegion::Europe);
        assert_eq!(estimate.transit_days, 5 + 7);
        assert_eq!(estimate.buffer_days, 3 + 2);
    }

    #[test]
    fn missing_country_is_domestic_and_unknown_is_other() {
        let estimator = TransitEstimator::default();
        assert_eq!(estimator.region_for(None), DestinationRegion::Domestic);
        assert_eq!(estimator.region_for(Some("  ")), DestinationRegion::Domestic);
        assert_eq!(estimator.region_for(Some("BR")), DestinationRegion::Other);
    }

    #[test]
    fn home_country_is_configurable() {
        let estimator = TransitEstimator::new("de");
        assert_eq!(estimator.region_for(Some("DE")), DestinationRegion::Domestic);
        assert_eq!(
            estimator.region_for(Some("US")),
            DestinationRegion::NorthAmerica
        );
    }
}
