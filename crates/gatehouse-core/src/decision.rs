//! Decisions and Scopes
//!
//! A request is checked against up to six bucket scopes, ordered from most
//! local to most global. Each check yields a `CheckOutcome`; the decisioner
//! aggregates them into a single `Decision` by severity, and the middleware
//! turns that decision into response headers.

use serde::{Deserialize, Serialize};

/// Throttle classification of a bucket after refill.
///
/// Ordering is severity: `Normal < Soft < Hard`, so aggregation can take a
/// plain `max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleState {
    Normal,
    Soft,
    Hard,
}

impl ThrottleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThrottleState::Normal => "normal",
            ThrottleState::Soft => "soft",
            ThrottleState::Hard => "hard",
        }
    }

    /// Decode the numeric state returned by the store-side script.
    pub fn from_wire(value: i64) -> Self {
        match value {
            2 => ThrottleState::Hard,
            1 => ThrottleState::Soft,
            _ => ThrottleState::Normal,
        }
    }
}

/// The six rate-limit levels, from most local to most global. The variant
/// order is the check order; ties between equally severe outcomes resolve to
/// the earlier scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    UserGlobal,
    UserEndpoint,
    TenantGlobal,
    TenantEndpoint,
    GlobalEndpoint,
    GlobalSystem,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::UserGlobal => "user_global",
            Scope::UserEndpoint => "user_endpoint",
            Scope::TenantGlobal => "tenant_global",
            Scope::TenantEndpoint => "tenant_endpoint",
            Scope::GlobalEndpoint => "global_endpoint",
            Scope::GlobalSystem => "global_system",
        }
    }
}

/// Result of evaluating one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub scope: Scope,
    pub key: String,
    pub allowed: bool,
    pub state: ThrottleState,

    /// Whole tokens left in the bucket after this evaluation.
    pub tokens_remaining: i64,

    /// Whole-percent usage of burst capacity.
    pub usage_pct: i64,

    /// The rpm limit configured for this scope.
    pub limit: u32,

    /// Epoch seconds at which the bucket is predicted full again.
    pub reset_epoch_s: i64,

    /// Seconds to wait before retrying; populated on hard throttles only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_s: Option<u64>,
}

/// The aggregated outcome for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    pub state: ThrottleState,

    /// The scope that determined the outcome.
    pub scope: Scope,

    /// rpm limit of the determining scope.
    pub limit: u32,

    /// Tokens remaining in the determining scope, floored at zero.
    pub remaining: u64,

    /// Epoch seconds at which the determining bucket refills completely.
    pub reset_epoch_s: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_s: Option<u64>,

    /// Per-scope outcomes, in check order, for debugging and shadow
    /// analysis.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checks: Vec<CheckOutcome>,
}

impl Decision {
    /// Collapse per-scope outcomes into one decision: the worst state wins,
    /// ties resolve to the earliest check.
    pub fn aggregate(checks: Vec<CheckOutcome>) -> Option<Decision> {
        let worst = checks
            .iter()
            .enumerate()
            .max_by(|(ia, a), (ib, b)| {
                a.state
                    .cmp(&b.state)
                    // On equal severity prefer the EARLIER check.
                    .then(ib.cmp(ia))
            })
            .map(|(i, _)| i)?;

        let pick = checks[worst].clone();
        Some(Decision {
            allowed: pick.allowed,
            state: pick.state,
            scope: pick.scope,
            limit: pick.limit,
            remaining: pick.tokens_remaining.max(0) as u64,
            reset_epoch_s: pick.reset_epoch_s,
            retry_after_s: pick.retry_after_s,
            checks,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(scope: Scope, state: ThrottleState) -> CheckOutcome {
        CheckOutcome {
            scope,
            key: format!("key-{}", scope.as_str()),
            allowed: state != ThrottleState::Hard,
            state,
            tokens_remaining: 10,
            usage_pct: 50,
            limit: 100,
            reset_epoch_s: 1_700_000_000,
            retry_after_s: (state == ThrottleState::Hard).then_some(3),
        }
    }

    #[test]
    fn state_severity_orders() {
        assert!(ThrottleState::Normal < ThrottleState::Soft);
        assert!(ThrottleState::Soft < ThrottleState::Hard);
    }

    #[test]
    fn aggregate_picks_worst_state() {
        let decision = Decision::aggregate(vec![
            outcome(Scope::UserGlobal, ThrottleState::Normal),
            outcome(Scope::TenantGlobal, ThrottleState::Hard),
            outcome(Scope::GlobalSystem, ThrottleState::Soft),
        ])
        .unwrap();
        assert_eq!(decision.scope, Scope::TenantGlobal);
        assert_eq!(decision.state, ThrottleState::Hard);
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_s, Some(3));
    }

    #[test]
    fn aggregate_breaks_ties_by_check_order() {
        let decision = Decision::aggregate(vec![
            outcome(Scope::UserGlobal, ThrottleState::Normal),
            outcome(Scope::TenantGlobal, ThrottleState::Normal),
        ])
        .unwrap();
        assert_eq!(decision.scope, Scope::UserGlobal);

        let decision = Decision::aggregate(vec![
            outcome(Scope::UserGlobal, ThrottleState::Soft),
            outcome(Scope::TenantGlobal, ThrottleState::Soft),
        ])
        .unwrap();
        assert_eq!(decision.scope, Scope::UserGlobal);
    }

    #[test]
    fn aggregate_of_empty_list_is_none() {
        assert!(Decision::aggregate(vec![]).is_none());
    }

    #[test]
    fn remaining_floors_at_zero() {
        let mut check = outcome(Scope::UserGlobal, ThrottleState::Hard);
        check.tokens_remaining = -2;
        let decision = Decision::aggregate(vec![check]).unwrap();
        assert_eq!(decision.remaining, 0);
    }

    #[test]
    fn wire_state_decodes() {
        assert_eq!(ThrottleState::from_wire(0), ThrottleState::Normal);
        assert_eq!(ThrottleState::from_wire(1), ThrottleState::Soft);
        assert_eq!(ThrottleState::from_wire(2), ThrottleState::Hard);
    }
}
