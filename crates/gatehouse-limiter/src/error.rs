//! Limiter Error Types
//!
//! The error taxonomy of the decision pipeline. The split matters because
//! different kinds recover differently:
//!
//! **Store failures** (`StoreTimeout`, `StoreUnavailable`, `ScriptMissing`,
//! `CircuitOpen`) feed the circuit breaker and divert the request to the
//! local fallback limiter, so the caller still gets a decision.
//!
//! **Everything else** surfaces to the middleware, which fails open: the
//! request passes with `X-RateLimit-Error: true` and never sees a 5xx from
//! rate-limiter internals. Only `Cancelled` abandons the request without a
//! decision.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, LimiterError>;

#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("No rate-limit policy for tenant: {0}")]
    PolicyNotFound(String),

    #[error("Store deadline exceeded")]
    StoreTimeout,

    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Bucket script missing from store after reload")]
    ScriptMissing,

    #[error("Override lookup failed: {0}")]
    OverrideLookup(String),

    #[error("Circuit breaker open")]
    CircuitOpen,

    #[error("Request cancelled by caller")]
    Cancelled,

    #[error("Policy backend error: {0}")]
    Policy(#[from] gatehouse_policy::PolicyError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LimiterError {
    /// Failures of the shared store, which engage the circuit breaker and
    /// the fallback limiter instead of surfacing.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            LimiterError::StoreTimeout
                | LimiterError::StoreUnavailable(_)
                | LimiterError::ScriptMissing
                | LimiterError::CircuitOpen
        )
    }

    /// Label used for `gatehouse_fallback_activations_total{reason}`.
    pub fn fallback_reason(&self) -> &'static str {
        match self {
            LimiterError::CircuitOpen => "circuit_open",
            LimiterError::StoreTimeout => "store_timeout",
            _ => "store_unavailable",
        }
    }
}

impl From<redis::RedisError> for LimiterError {
    fn from(e: redis::RedisError) -> Self {
        if e.kind() == redis::ErrorKind::NoScriptError {
            LimiterError::ScriptMissing
        } else if e.is_timeout() {
            LimiterError::StoreTimeout
        } else {
            LimiterError::StoreUnavailable(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_failures_are_classified() {
        assert!(LimiterError::StoreTimeout.is_store_failure());
        assert!(LimiterError::StoreUnavailable("conn refused".into()).is_store_failure());
        assert!(LimiterError::ScriptMissing.is_store_failure());
        assert!(LimiterError::CircuitOpen.is_store_failure());
        assert!(!LimiterError::PolicyNotFound("acme".into()).is_store_failure());
        assert!(!LimiterError::Cancelled.is_store_failure());
    }

    #[test]
    fn fallback_reasons() {
        assert_eq!(LimiterError::CircuitOpen.fallback_reason(), "circuit_open");
        assert_eq!(LimiterError::StoreTimeout.fallback_reason(), "store_timeout");
        assert_eq!(
            LimiterError::StoreUnavailable("x".into()).fallback_reason(),
            "store_unavailable"
        );
    }
}
