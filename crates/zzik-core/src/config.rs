//! Engine configuration shared by the guard and check-in layers.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::CoreError;

/// A fixed-window limit: at most `count` actions per `window_secs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub count: u32,
    pub window_secs: u64,
}

impl RateLimitConfig {
    pub const fn new(count: u32, window_secs: u64) -> Self {
        Self { count, window_secs }
    }
}

/// A rate limit with a name used in rejection details ("hourly", "daily").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamedLimit {
    pub name: String,
    #[serde(flatten)]
    pub config: RateLimitConfig,
}

impl NamedLimit {
    pub fn new(name: &str, config: RateLimitConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
        }
    }
}

/// Upper bound for every configured window or TTL: one (leap) year.
pub const MAX_WINDOW_SECS: u64 = 366 * 86_400;

/// Predefined limits.
pub mod limits {
    use super::RateLimitConfig;

    pub const CHECKIN_HOURLY: RateLimitConfig = RateLimitConfig::new(10, 3_600);
    pub const CHECKIN_DAILY: RateLimitConfig = RateLimitConfig::new(50, 86_400);
    pub const TOKEN_REDEEM_DAILY: RateLimitConfig = RateLimitConfig::new(5, 86_400);
    pub const QR_SCAN_HOURLY: RateLimitConfig = RateLimitConfig::new(20, 3_600);
    pub const API_MINUTE: RateLimitConfig = RateLimitConfig::new(100, 60);
    pub const API_HOURLY: RateLimitConfig = RateLimitConfig::new(1_000, 3_600);
}

/// Tunables for the check-in pipeline.
///
/// Every field has a default, so a config file only needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Limits applied to the `checkin` action, checked in order.
    pub rate_limits: Vec<NamedLimit>,
    /// Maximum POI distance for a GPS check-in, and the HYBRID threshold for QR.
    pub max_gps_distance_m: f64,
    pub premium_tokens_per_check_in: u64,
    pub free_monthly_limit: u32,
    pub free_period_days: i64,
    pub idempotency_ttl_secs: u64,
    pub history_window_hours: i64,
    pub history_limit: usize,
    /// Auto-block events within 24h that suspend an account.
    pub auto_block_threshold: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rate_limits: vec![
                NamedLimit::new("hourly", limits::CHECKIN_HOURLY),
                NamedLimit::new("daily", limits::CHECKIN_DAILY),
            ],
            max_gps_distance_m: 50.0,
            premium_tokens_per_check_in: 100,
            free_monthly_limit: 3,
            free_period_days: 30,
            idempotency_ttl_secs: 120,
            history_window_hours: 24,
            history_limit: 20,
            auto_block_threshold: 3,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(s: &str) -> Result<Self, CoreError> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, CoreError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if !self.max_gps_distance_m.is_finite() || self.max_gps_distance_m <= 0.0 {
            return Err(CoreError::Config(format!(
                "max_gps_distance_m must be positive, got {}",
                self.max_gps_distance_m
            )));
        }
        for limit in &self.rate_limits {
            if limit.config.window_secs == 0 {
                return Err(CoreError::Config(format!(
                    "rate limit {:?} has a zero window",
                    limit.name
                )));
            }
            if limit.config.window_secs > MAX_WINDOW_SECS {
                return Err(CoreError::Config(format!(
                    "rate limit {:?} window exceeds {MAX_WINDOW_SECS}s",
                    limit.name
                )));
            }
        }
        if self.idempotency_ttl_secs > MAX_WINDOW_SECS {
            return Err(CoreError::Config(format!(
                "idempotency_ttl_secs must be <= {MAX_WINDOW_SECS}, got {}",
                self.idempotency_ttl_secs
            )));
        }
        if !(1..=MAX_WINDOW_SECS as i64 / 3_600).contains(&self.history_window_hours) {
            return Err(CoreError::Config(format!(
                "history_window_hours must be within 1..={}, got {}",
                MAX_WINDOW_SECS / 3_600,
                self.history_window_hours
            )));
        }
        if !(1..=MAX_WINDOW_SECS as i64 / 86_400).contains(&self.free_period_days) {
            return Err(CoreError::Config(format!(
                "free_period_days must be within 1..={}, got {}",
                MAX_WINDOW_SECS / 86_400,
                self.free_period_days
            )));
        }
        if self.history_limit == 0 {
            return Err(CoreError::Config("history_limit must be >= 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_catalogue() {
        let config = EngineConfig::default();
        assert_eq!(config.rate_limits.len(), 2);
        assert_eq!(config.rate_limits[0].name, "hourly");
        assert_eq!(config.rate_limits[0].config, RateLimitConfig::new(10, 3_600));
        assert_eq!(config.rate_limits[1].config, RateLimitConfig::new(50, 86_400));
        assert_eq!(config.max_gps_distance_m, 50.0);
        assert_eq!(config.idempotency_ttl_secs, 120);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(r#"{ "premium_tokens_per_check_in": 250 }"#)
            .unwrap();
        assert_eq!(config.premium_tokens_per_check_in, 250);
        assert_eq!(config.free_monthly_limit, 3);
    }

    #[test]
    fn named_limits_flatten() {
        let config = EngineConfig::from_json_str(
            r#"{ "rate_limits": [ { "name": "burst", "count": 2, "window_secs": 60 } ] }"#,
        )
        .unwrap();
        assert_eq!(config.rate_limits, vec![NamedLimit::new("burst", RateLimitConfig::new(2, 60))]);
    }

    #[test]
    fn zero_window_rejected() {
        let result = EngineConfig::from_json_str(
            r#"{ "rate_limits": [ { "name": "bad", "count": 2, "window_secs": 0 } ] }"#,
        );
        assert!(matches!(result, Err(CoreError::Config(_))));
    }

    #[test]
    fn unbounded_windows_rejected() {
        let huge = EngineConfig::from_json_str(
            r#"{ "rate_limits": [ { "name": "forever", "count": 2, "window_secs": 18446744073709551615 } ] }"#,
        );
        assert!(matches!(huge, Err(CoreError::Config(_))));

        for bad in [
            r#"{ "idempotency_ttl_secs": 18446744073709551615 }"#,
            r#"{ "history_window_hours": -5 }"#,
            r#"{ "history_window_hours": 9223372036854775807 }"#,
            r#"{ "free_period_days": 0 }"#,
            r#"{ "free_period_days": 100000000000 }"#,
        ] {
            assert!(
                matches!(EngineConfig::from_json_str(bad), Err(CoreError::Config(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn one_year_window_accepted() {
        let config = EngineConfig::from_json_str(
            r#"{ "rate_limits": [ { "name": "yearly", "count": 500, "window_secs": 31622400 } ],
                 "free_period_days": 366 }"#,
        )
        .unwrap();
        assert_eq!(config.rate_limits[0].config.window_secs, MAX_WINDOW_SECS);
    }

    #[test]
    fn missing_file_is_io_error() {
        let result = EngineConfig::from_json_file(Path::new("/nonexistent/zzik.json"));
        assert!(matches!(result, Err(CoreError::Io(_))));
    }
}
