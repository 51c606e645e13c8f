//! Override Type Definitions
//!
//! An override is a time-bounded modification of a tenant's effective
//! policy, created either by an operator or by the abuse detector. An
//! override may target the whole tenant or narrow down to a user and/or an
//! endpoint; when several active overrides could match one request, the most
//! specific shape wins.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How an override modifies the effective policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideType {
    /// Scale the tenant (and user) limits by `penalty_multiplier`.
    PenaltyMultiplier,
    /// Deny every request until the override expires.
    TemporaryBan,
    /// Replace the targeted scope with `custom_rate`/`custom_burst`.
    CustomLimit,
}

impl OverrideType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverrideType::PenaltyMultiplier => "penalty_multiplier",
            OverrideType::TemporaryBan => "temporary_ban",
            OverrideType::CustomLimit => "custom_limit",
        }
    }
}

/// Who created the override.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideSource {
    AutoDetector,
    ManualOperator,
}

impl OverrideSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            OverrideSource::AutoDetector => "auto_detector",
            OverrideSource::ManualOperator => "manual_operator",
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum OverrideValidationError {
    #[error("expires_at {expires_at} is not in the future (now {now})")]
    AlreadyExpired { expires_at: i64, now: i64 },

    #[error("penalty_multiplier must be in (0, 1] (got {0})")]
    MultiplierOutOfRange(f64),

    #[error("{0} is required for this override type")]
    MissingField(&'static str),
}

/// Time-bounded policy modification for a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Override {
    pub id: String,
    pub tenant_id: String,

    /// Narrow the override to one user of the tenant.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Narrow the override to one endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    pub override_type: OverrideType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub penalty_multiplier: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_rate: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_burst: Option<u32>,

    pub reason: String,
    pub source: OverrideSource,

    /// Milliseconds since epoch.
    pub created_at: i64,

    /// Milliseconds since epoch; the store drops the override at this time.
    pub expires_at: i64,
}

impl Override {
    pub fn validate(&self, now_ms: i64) -> Result<(), OverrideValidationError> {
        if self.expires_at <= now_ms {
            return Err(OverrideValidationError::AlreadyExpired {
                expires_at: self.expires_at,
                now: now_ms,
            });
        }
        match self.override_type {
            OverrideType::PenaltyMultiplier => match self.penalty_multiplier {
                None => return Err(OverrideValidationError::MissingField("penalty_multiplier")),
                Some(m) if m <= 0.0 || m > 1.0 => {
                    return Err(OverrideValidationError::MultiplierOutOfRange(m))
                }
                Some(_) => {}
            },
            OverrideType::CustomLimit => {
                if self.custom_rate.is_none() {
                    return Err(OverrideValidationError::MissingField("custom_rate"));
                }
                if self.custom_burst.is_none() {
                    return Err(OverrideValidationError::MissingField("custom_burst"));
                }
            }
            OverrideType::TemporaryBan => {}
        }
        Ok(())
    }

    /// Does this override apply to a request by `user_id` on `endpoint`?
    ///
    /// An absent field on the override means "any"; a present field must
    /// match exactly.
    pub fn matches(&self, user_id: &str, endpoint: &str) -> bool {
        let user_ok = self
            .user_id
            .as_deref()
            .map(|u| u == user_id)
            .unwrap_or(true);
        let endpoint_ok = self
            .endpoint
            .as_deref()
            .map(|e| e == endpoint)
            .unwrap_or(true);
        user_ok && endpoint_ok
    }

    /// Precedence rank: more specific shapes win over broader ones.
    pub fn specificity(&self) -> u8 {
        match (self.user_id.is_some(), self.endpoint.is_some()) {
            (true, true) => 3,
            (true, false) => 2,
            (false, true) => 1,
            (false, false) => 0,
        }
    }

    /// Whole seconds until expiry, rounded up. Zero once expired.
    pub fn retry_after_s(&self, now_ms: i64) -> u64 {
        let remaining_ms = self.expires_at.saturating_sub(now_ms);
        if remaining_ms <= 0 {
            0
        } else {
            (remaining_ms as u64).div_ceil(1000)
        }
    }
}

/// Pick the override that governs a request, by precedence: user+endpoint,
/// then user, then endpoint, then tenant-wide. Ties within one shape break
/// toward the most recently created override.
pub fn select_active<'a>(
    overrides: &'a [Override],
    user_id: &str,
    endpoint: &str,
) -> Option<&'a Override> {
    overrides
        .iter()
        .filter(|o| o.matches(user_id, endpoint))
        .max_by_key(|o| (o.specificity(), o.created_at))
}
