//! Policy Store Error Types
//!
//! All policy and override operations return `Result<T>` aliased to
//! `Result<T, PolicyError>` so call sites propagate with `?`. Validation
//! failures are surfaced as their own variants so the admin API can map them
//! to 400s while database failures stay 5xx-shaped.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PolicyError>;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("Tenant policy not found: {0}")]
    TenantNotFound(String),

    #[error("Override not found: {0}")]
    OverrideNotFound(String),

    #[error("Invalid policy: {0}")]
    InvalidPolicy(#[from] gatehouse_core::PolicyValidationError),

    #[error("Invalid override: {0}")]
    InvalidOverride(#[from] gatehouse_core::overrides::OverrideValidationError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PolicyError {
    /// True for the not-found variants, which the hot path treats
    /// differently from infrastructure failures.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            PolicyError::TenantNotFound(_) | PolicyError::OverrideNotFound(_)
        )
    }
}
