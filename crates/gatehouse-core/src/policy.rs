//! Policy Type Definitions
//!
//! A `BucketPolicy` is the semantic quadruple `(rpm, rps, burst_capacity,
//! refill_rate_per_sec)` behind one token bucket. A `TenantPolicy` bundles
//! the buckets configured for a tenant together with its throttle
//! thresholds; the `GlobalPolicy` singleton does the same for the system as
//! a whole.
//!
//! Policies are validated at construction/upsert time, never in the hot
//! path. `normalize()` fills the derived `refill_rate_per_sec` before a
//! policy is cached so readers never re-derive it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised when a policy fails range validation.
#[derive(Debug, Error, PartialEq)]
pub enum PolicyValidationError {
    #[error("{field} must be positive (got {value})")]
    NotPositive { field: &'static str, value: f64 },

    #[error("burst_capacity {burst} is below one second of traffic ({min:.2})")]
    BurstTooSmall { burst: u32, min: f64 },

    #[error("{field} must be in (0, 200] (got {value})")]
    ThresholdOutOfRange { field: &'static str, value: f64 },

    #[error("hard_threshold_pct {hard} must exceed soft_threshold_pct {soft}")]
    HardBelowSoft { hard: f64, soft: f64 },
}

/// Token-bucket limit definition for a single scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketPolicy {
    /// Requests per minute.
    pub rpm: u32,

    /// Requests per second (rpm / 60 unless set explicitly).
    pub rps: f64,

    /// Maximum token count (the bucket ceiling).
    pub burst_capacity: u32,

    /// Tokens restored per second. Derived as rpm / 60 when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refill_rate_per_sec: Option<f64>,
}

impl BucketPolicy {
    /// Build a policy from rpm and burst capacity, deriving the per-second
    /// figures.
    pub fn per_minute(rpm: u32, burst_capacity: u32) -> Self {
        Self {
            rpm,
            rps: rpm as f64 / 60.0,
            burst_capacity,
            refill_rate_per_sec: Some(rpm as f64 / 60.0),
        }
    }

    /// Effective refill rate in tokens per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate_per_sec
            .unwrap_or(self.rpm as f64 / 60.0)
    }

    /// Fill the derived refill rate so cached copies carry it explicitly.
    pub fn normalize(&mut self) {
        if self.refill_rate_per_sec.is_none() {
            self.refill_rate_per_sec = Some(self.rpm as f64 / 60.0);
        }
    }

    /// Scale every limit by `multiplier`, flooring at one token so a harsh
    /// penalty never collapses a bucket to zero.
    pub fn scaled(&self, multiplier: f64) -> Self {
        let scale_u32 = |v: u32| ((v as f64 * multiplier).floor() as u32).max(1);
        let scale_f64 = |v: f64| {
            let scaled = v * multiplier;
            if scaled < f64::MIN_POSITIVE {
                v
            } else {
                scaled
            }
        };
        Self {
            rpm: scale_u32(self.rpm),
            rps: scale_f64(self.rps),
            burst_capacity: scale_u32(self.burst_capacity),
            refill_rate_per_sec: Some(scale_f64(self.refill_rate())),
        }
    }

    pub fn validate(&self) -> Result<(), PolicyValidationError> {
        if self.rpm == 0 {
            return Err(PolicyValidationError::NotPositive {
                field: "rpm",
                value: 0.0,
            });
        }
        if self.rps <= 0.0 {
            return Err(PolicyValidationError::NotPositive {
                field: "rps",
                value: self.rps,
            });
        }
        if self.burst_capacity == 0 {
            return Err(PolicyValidationError::NotPositive {
                field: "burst_capacity",
                value: 0.0,
            });
        }
        if self.refill_rate() <= 0.0 {
            return Err(PolicyValidationError::NotPositive {
                field: "refill_rate_per_sec",
                value: self.refill_rate(),
            });
        }
        // At least one second of capacity.
        let min_burst = self.rpm as f64 / 60.0;
        if (self.burst_capacity as f64) < min_burst {
            return Err(PolicyValidationError::BurstTooSmall {
                burst: self.burst_capacity,
                min: min_burst,
            });
        }
        Ok(())
    }
}

/// Soft/hard usage thresholds, as percentages of burst capacity consumed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Usage percentage at which requests are denied. Required, (0, 200].
    pub hard_threshold_pct: f64,

    /// Usage percentage at which warnings start. When absent there is no
    /// soft zone: states go straight from normal to hard.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soft_threshold_pct: Option<f64>,
}

impl ThrottleConfig {
    pub fn new(hard: f64, soft: Option<f64>) -> Self {
        Self {
            hard_threshold_pct: hard,
            soft_threshold_pct: soft,
        }
    }

    /// The soft threshold actually applied; equals the hard threshold when
    /// no soft zone is configured.
    pub fn effective_soft(&self) -> f64 {
        self.soft_threshold_pct.unwrap_or(self.hard_threshold_pct)
    }

    pub fn validate(&self) -> Result<(), PolicyValidationError> {
        if self.hard_threshold_pct <= 0.0 || self.hard_threshold_pct > 200.0 {
            return Err(PolicyValidationError::ThresholdOutOfRange {
                field: "hard_threshold_pct",
                value: self.hard_threshold_pct,
            });
        }
        if let Some(soft) = self.soft_threshold_pct {
            if soft <= 0.0 || soft > 200.0 {
                return Err(PolicyValidationError::ThresholdOutOfRange {
                    field: "soft_threshold_pct",
                    value: soft,
                });
            }
            if self.hard_threshold_pct <= soft {
                return Err(PolicyValidationError::HardBelowSoft {
                    hard: self.hard_threshold_pct,
                    soft,
                });
            }
        }
        Ok(())
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            hard_threshold_pct: 110.0,
            soft_threshold_pct: Some(100.0),
        }
    }
}

/// Rate-limit configuration for one tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantPolicy {
    pub tenant_id: String,

    /// Limit applied to every user of this tenant individually. Optional;
    /// tenants without per-user limits skip the user_global scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<BucketPolicy>,

    /// Limit applied to the tenant as a whole. Required.
    pub tenant: BucketPolicy,

    /// Per-endpoint limits applied per user.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub user_endpoints: HashMap<String, BucketPolicy>,

    /// Per-endpoint limits applied to the tenant as a whole.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub tenant_endpoints: HashMap<String, BucketPolicy>,

    pub throttle: ThrottleConfig,
}

impl TenantPolicy {
    pub fn new(tenant_id: impl Into<String>, tenant: BucketPolicy) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user: None,
            tenant,
            user_endpoints: HashMap::new(),
            tenant_endpoints: HashMap::new(),
            throttle: ThrottleConfig::default(),
        }
    }

    /// Fill derived fields on every contained bucket.
    pub fn normalize(&mut self) {
        if let Some(user) = self.user.as_mut() {
            user.normalize();
        }
        self.tenant.normalize();
        for policy in self.user_endpoints.values_mut() {
            policy.normalize();
        }
        for policy in self.tenant_endpoints.values_mut() {
            policy.normalize();
        }
    }

    pub fn validate(&self) -> Result<(), PolicyValidationError> {
        if let Some(user) = &self.user {
            user.validate()?;
        }
        self.tenant.validate()?;
        for policy in self.user_endpoints.values() {
            policy.validate()?;
        }
        for policy in self.tenant_endpoints.values() {
            policy.validate()?;
        }
        self.throttle.validate()
    }
}

/// System-wide limits protecting the service behind every tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalPolicy {
    /// Required system-wide bucket.
    pub system: BucketPolicy,

    /// Optional per-endpoint buckets shared by all tenants.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub endpoints: HashMap<String, BucketPolicy>,
}

impl GlobalPolicy {
    /// A deliberately generous policy used when no global policy has been
    /// provisioned, so tenant limits remain the binding constraint.
    pub fn permissive() -> Self {
        Self {
            system: BucketPolicy::per_minute(6_000_000, 200_000),
            endpoints: HashMap::new(),
        }
    }

    pub fn normalize(&mut self) {
        self.system.normalize();
        for policy in self.endpoints.values_mut() {
            policy.normalize();
        }
    }

    pub fn validate(&self) -> Result<(), PolicyValidationError> {
        self.system.validate()?;
        for policy in self.endpoints.values() {
            policy.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_minute_derives_rates() {
        let policy = BucketPolicy::per_minute(600, 1200);
        assert_eq!(policy.rpm, 600);
        assert!((policy.rps - 10.0).abs() < f64::EPSILON);
        assert!((policy.refill_rate() - 10.0).abs() < f64::EPSILON);
    }

    #[test]
    fn normalize_fills_refill_rate() {
        let mut policy = BucketPolicy {
            rpm: 120,
            rps: 2.0,
            burst_capacity: 50,
            refill_rate_per_sec: None,
        };
        assert!((policy.refill_rate() - 2.0).abs() < f64::EPSILON);
        policy.normalize();
        assert_eq!(policy.refill_rate_per_sec, Some(2.0));
    }

    #[test]
    fn validate_rejects_zero_limits() {
        let mut policy = BucketPolicy::per_minute(100, 200);
        policy.rpm = 0;
        assert!(matches!(
            policy.validate(),
            Err(PolicyValidationError::NotPositive { field: "rpm", .. })
        ));
    }

    #[test]
    fn validate_requires_one_second_of_burst() {
        let mut policy = BucketPolicy::per_minute(6000, 6000);
        policy.burst_capacity = 50; // below 6000/60 = 100
        assert!(matches!(
            policy.validate(),
            Err(PolicyValidationError::BurstTooSmall { .. })
        ));
    }

    #[test]
    fn scaled_floors_at_one_token() {
        let policy = BucketPolicy::per_minute(5, 5);
        let scaled = policy.scaled(0.1);
        assert_eq!(scaled.rpm, 1);
        assert_eq!(scaled.burst_capacity, 1);
        assert!(scaled.refill_rate() > 0.0);
    }

    #[test]
    fn scaled_applies_multiplier() {
        let policy = BucketPolicy::per_minute(10_000, 20_000);
        let scaled = policy.scaled(0.1);
        assert_eq!(scaled.rpm, 1000);
        assert_eq!(scaled.burst_capacity, 2000);
        assert!((scaled.refill_rate() - 10_000.0 / 60.0 * 0.1).abs() < 1e-9);
    }

    #[test]
    fn throttle_soft_defaults_to_hard() {
        let throttle = ThrottleConfig::new(110.0, None);
        assert!((throttle.effective_soft() - 110.0).abs() < f64::EPSILON);
    }

    #[test]
    fn throttle_rejects_hard_at_or_below_soft() {
        assert!(ThrottleConfig::new(100.0, Some(100.0)).validate().is_err());
        assert!(ThrottleConfig::new(90.0, Some(100.0)).validate().is_err());
        assert!(ThrottleConfig::new(110.0, Some(100.0)).validate().is_ok());
    }

    #[test]
    fn throttle_rejects_out_of_range() {
        assert!(ThrottleConfig::new(0.0, None).validate().is_err());
        assert!(ThrottleConfig::new(250.0, None).validate().is_err());
        assert!(ThrottleConfig::new(110.0, Some(250.0)).validate().is_err());
    }

    #[test]
    fn tenant_policy_roundtrips_through_json() {
        let mut policy = TenantPolicy::new("acme", BucketPolicy::per_minute(10_000, 20_000));
        policy.user = Some(BucketPolicy::per_minute(1000, 2000));
        policy
            .tenant_endpoints
            .insert("/api/upload".to_string(), BucketPolicy::per_minute(100, 150));

        let json = serde_json::to_string(&policy).unwrap();
        let back: TenantPolicy = serde_json::from_str(&json).unwrap();
        assert_eq!(policy, back);
    }

    #[test]
    fn tenant_policy_normalize_covers_endpoint_maps() {
        let mut policy = TenantPolicy::new(
            "acme",
            BucketPolicy {
                rpm: 600,
                rps: 10.0,
                burst_capacity: 1200,
                refill_rate_per_sec: None,
            },
        );
        policy.tenant_endpoints.insert(
            "/api/search".to_string(),
            BucketPolicy {
                rpm: 60,
                rps: 1.0,
                burst_capacity: 10,
                refill_rate_per_sec: None,
            },
        );
        policy.normalize();
        assert!(policy.tenant.refill_rate_per_sec.is_some());
        assert!(policy.tenant_endpoints["/api/search"]
            .refill_rate_per_sec
            .is_some());
    }

    #[test]
    fn permissive_global_validates() {
        assert!(GlobalPolicy::permissive().validate().is_ok());
    }
}
