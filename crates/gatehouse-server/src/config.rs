//! Server Configuration
//!
//! One flat, typed record for every knob the service recognises. Ranges are
//! enforced at construction time by [`GatehouseConfig::validate`] so the
//! unit of failure is startup, not a surprise in the hot path.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// How decisions are applied to traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitMode {
    /// Decide and record, never block; responses carry shadow headers.
    Shadow,
    /// Like shadow, but exceeded requests are flagged loudly.
    Logging,
    /// Hard decisions return 429.
    Enforcement,
}

impl RateLimitMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitMode::Shadow => "shadow",
            RateLimitMode::Logging => "logging",
            RateLimitMode::Enforcement => "enforcement",
        }
    }
}

impl std::str::FromStr for RateLimitMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "shadow" => Ok(RateLimitMode::Shadow),
            "logging" => Ok(RateLimitMode::Logging),
            "enforcement" => Ok(RateLimitMode::Enforcement),
            other => Err(ConfigError::InvalidMode(other.to_string())),
        }
    }
}

/// How the abuse detector penalises flagged tenants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PenaltyType {
    /// Scale the tenant's own limits down by `abuse_penalty_multiplier`.
    Adaptive,
    /// Replace the tenant limit with a fixed rate/burst.
    Fixed,
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("unknown rate-limit mode: {0} (expected shadow | logging | enforcement)")]
    InvalidMode(String),

    #[error("{field} must be positive")]
    NotPositive { field: &'static str },

    #[error("{field} must be within {range} (got {value})")]
    OutOfRange {
        field: &'static str,
        range: &'static str,
        value: f64,
    },
}

/// Flat configuration record for the whole service.
#[derive(Debug, Clone)]
pub struct GatehouseConfig {
    pub mode: RateLimitMode,
    pub listen_port: u16,

    /// Shared bucket store.
    pub redis_url: String,
    /// Per-call deadline for store operations.
    pub store_timeout: Duration,
    /// TTL stamped on bucket keys.
    pub bucket_ttl: Duration,

    /// Policy database path (SQLite).
    pub database_path: String,

    pub circuit_failure_threshold: u32,
    pub circuit_timeout: Duration,
    pub circuit_success_threshold: u32,

    pub fallback_rpm: u32,

    pub policy_cache_ttl_ms: i64,
    pub policy_cache_max_size: usize,
    pub policy_cache_refresh_interval: Duration,

    pub override_cache_ttl_ms: i64,
    pub override_cache_max_size: usize,
    /// How often expired overrides are purged from the store.
    pub override_sweep_interval: Duration,

    pub abuse_enabled: bool,
    pub abuse_check_interval: Duration,
    /// Throttled/total ratio above which a tenant is flagged.
    pub abuse_throttle_threshold: f64,
    /// Telemetry look-back window.
    pub abuse_window_minutes: u32,
    pub abuse_penalty_duration: Duration,
    pub abuse_penalty_type: PenaltyType,
    /// Multiplier used for adaptive penalties.
    pub abuse_penalty_multiplier: f64,
    /// Rate/burst used for fixed penalties.
    pub abuse_penalty_rate: u32,
    pub abuse_penalty_burst: u32,

    /// Base URL of the Prometheus query API; the abuse detector is inert
    /// without it.
    pub prometheus_url: Option<String>,

    /// Shared secret enabling verified bearer-token decoding. Without it
    /// tokens are decoded unverified and treated as advisory.
    pub jwt_secret: Option<String>,
}

impl Default for GatehouseConfig {
    fn default() -> Self {
        Self {
            mode: RateLimitMode::Enforcement,
            listen_port: 8080,
            redis_url: "redis://127.0.0.1/".to_string(),
            store_timeout: Duration::from_millis(100),
            bucket_ttl: Duration::from_secs(3600),
            database_path: "gatehouse.db".to_string(),
            circuit_failure_threshold: 5,
            circuit_timeout: Duration::from_millis(60_000),
            circuit_success_threshold: 2,
            fallback_rpm: 60,
            policy_cache_ttl_ms: 60_000,
            policy_cache_max_size: 10_000,
            policy_cache_refresh_interval: Duration::from_secs(30),
            override_cache_ttl_ms: 30_000,
            override_cache_max_size: 10_000,
            override_sweep_interval: Duration::from_secs(60),
            abuse_enabled: true,
            abuse_check_interval: Duration::from_millis(60_000),
            abuse_throttle_threshold: 0.8,
            abuse_window_minutes: 5,
            abuse_penalty_duration: Duration::from_millis(300_000),
            abuse_penalty_type: PenaltyType::Adaptive,
            abuse_penalty_multiplier: 0.1,
            abuse_penalty_rate: 60,
            abuse_penalty_burst: 10,
            prometheus_url: None,
            jwt_secret: None,
        }
    }
}

impl GatehouseConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store_timeout.is_zero() {
            return Err(ConfigError::NotPositive {
                field: "store_timeout",
            });
        }
        if self.circuit_failure_threshold == 0 {
            return Err(ConfigError::NotPositive {
                field: "circuit_failure_threshold",
            });
        }
        if self.circuit_success_threshold == 0 {
            return Err(ConfigError::NotPositive {
                field: "circuit_success_threshold",
            });
        }
        if self.fallback_rpm == 0 {
            return Err(ConfigError::NotPositive {
                field: "fallback_rpm",
            });
        }
        if self.policy_cache_ttl_ms <= 0 {
            return Err(ConfigError::NotPositive {
                field: "policy_cache_ttl_ms",
            });
        }
        if self.policy_cache_max_size == 0 {
            return Err(ConfigError::NotPositive {
                field: "policy_cache_max_size",
            });
        }
        if self.override_cache_ttl_ms <= 0 {
            return Err(ConfigError::NotPositive {
                field: "override_cache_ttl_ms",
            });
        }
        if self.override_cache_max_size == 0 {
            return Err(ConfigError::NotPositive {
                field: "override_cache_max_size",
            });
        }
        if !(0.0 < self.abuse_throttle_threshold && self.abuse_throttle_threshold <= 1.0) {
            return Err(ConfigError::OutOfRange {
                field: "abuse_throttle_threshold",
                range: "(0, 1]",
                value: self.abuse_throttle_threshold,
            });
        }
        if self.abuse_window_minutes == 0 {
            return Err(ConfigError::NotPositive {
                field: "abuse_window_minutes",
            });
        }
        if !(0.0 < self.abuse_penalty_multiplier && self.abuse_penalty_multiplier <= 1.0) {
            return Err(ConfigError::OutOfRange {
                field: "abuse_penalty_multiplier",
                range: "(0, 1]",
                value: self.abuse_penalty_multiplier,
            });
        }
        if self.abuse_penalty_rate == 0 || self.abuse_penalty_burst == 0 {
            return Err(ConfigError::NotPositive {
                field: "abuse_penalty_rate/abuse_penalty_burst",
            });
        }
        Ok(())
    }
}
