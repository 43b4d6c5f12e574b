//! Engine configuration.
//!
//! # Responsibility
//! - Collect every tunable threshold in one serde-deserializable tree.
//! - Validate values before any service is constructed.
//!
//! # Invariants
//! - Every field has a default; an empty JSON object is a valid config.
//! - `validate()` must pass before the config reaches a service.

use crate::policy::PolicyConfig;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config `{}`: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config value `{field}`: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_secs: u64,
    pub max_delay_secs: u64,
    /// Symmetric jitter ratio in `[0, 1)`; `0.2` means ±20%.
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_secs: 60,
            max_delay_secs: 60 * 60,
            jitter_ratio: 0.2,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::seconds(clamp_secs(self.base_delay_secs))
    }

    pub fn max_delay(&self) -> Duration {
        Duration::seconds(clamp_secs(self.max_delay_secs))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Maximum deliveries claimed per tick.
    pub batch_limit: u32,
    /// `Processing` rows older than this are treated as crashed attempts.
    pub processing_timeout_secs: u64,
    pub poll_interval_secs: u64,
    /// Stuck-row count that escalates the recovery log to a warning.
    pub high_volume_warn_threshold: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            batch_limit: 100,
            processing_timeout_secs: 15 * 60,
            poll_interval_secs: 30,
            high_volume_warn_threshold: 10,
        }
    }
}

impl DispatchConfig {
    pub fn processing_timeout(&self) -> Duration {
        Duration::seconds(clamp_secs(self.processing_timeout_secs))
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Absolute log directory. File logging is skipped when unset.
    pub log_dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: crate::logging::default_log_level().to_string(),
            log_dir: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub policy: PolicyConfig,
    pub retry: RetryConfig,
    pub dispatch: DispatchConfig,
    pub logging: LoggingConfig,
}

impl EngineConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let policy = &self.policy;
        if policy.min_lead_minutes < 0 {
            return Err(invalid("policy.min_lead_minutes", "must not be negative"));
        }
        if policy.max_horizon_years == 0 {
            return Err(invalid("policy.max_horizon_years", "must be positive"));
        }
        if policy.cancellation_cutoff_hours < 0 {
            return Err(invalid(
                "policy.cancellation_cutoff_hours",
                "must not be negative",
            ));
        }
        if policy.arrive_by_min_days < 0 {
            return Err(invalid("policy.arrive_by_min_days", "must not be negative"));
        }
        if policy.max_transit_days == 0 || policy.max_transit_days > 366 {
            return Err(invalid("policy.max_transit_days", "must be within 1..=366"));
        }
        if policy.home_country.trim().len() != 2 {
            return Err(invalid(
                "policy.home_country",
                "must be an ISO 3166-1 alpha-2 code",
            ));
        }

        let retry = &self.retry;
        if retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts", "must be at least 1"));
        }
        if retry.base_delay_secs == 0 {
            return Err(invalid("retry.base_delay_secs", "must be positive"));
        }
        if retry.max_delay_secs < retry.base_delay_secs {
            return Err(invalid(
                "retry.max_delay_secs",
                "must not be smaller than base_delay_secs",
            ));
        }
        if !(0.0..1.0).contains(&retry.jitter_ratio) {
            return Err(invalid("retry.jitter_ratio", "must be within [0, 1)"));
        }

        let dispatch = &self.dispatch;
        if dispatch.batch_limit == 0 {
            return Err(invalid("dispatch.batch_limit", "must be at least 1"));
        }
        if dispatch.processing_timeout_secs == 0 {
            return Err(invalid("dispatch.processing_timeout_secs", "must be positive"));
        }
        if dispatch.poll_interval_secs == 0 {
            return Err(invalid("dispatch.poll_interval_secs", "must be positive"));
        }

        Ok(())
    }
}

fn invalid(field: &'static str, message: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        message: message.to_string(),
    }
}

fn clamp_secs(value: u64) -> i64 {
    const MAX_SECS: i64 = i64::MAX / 1_000;
    i64::try_from(value).map_or(MAX_SECS, |secs| secs.min(MAX_SECS))
}

#[cfg(test)]
mod tests {
    use super::{ConfigError, EngineConfig};

    #[test]
    fn empty_object_yields_defaults() {
        let config = EngineConfig::from_json_str("{}").expect("defaults should validate");
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.policy.cancellation_cutoff_hours, 72);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = EngineConfig::from_json_str(
            r#"{ "retry": { "max_attempts": 3 }, "dispatch": { "batch_limit": 7 } }"#,
        )
        .expect("partial config should parse");
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay_secs, 60);
        assert_eq!(config.dispatch.batch_limit, 7);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let err = EngineConfig::from_json_str(r#"{ "retry": { "jitter_ratio": 1.5 } }"#)
            .expect_err("jitter ratio above one must fail");
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "retry.jitter_ratio",
                ..
            }
        ));

        let err = EngineConfig::from_json_str(r#"{ "policy": { "max_transit_days": 0 } }"#)
            .expect_err("zero transit bound must fail");
        assert!(matches!(
            err,
            ConfigError::Invalid {
                field: "policy.max_transit_days",
                ..
            }
        ));

        let err = EngineConfig::from_json_str("{ not json").expect_err("garbage must fail");
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
