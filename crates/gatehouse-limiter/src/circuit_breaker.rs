//! Circuit Breaker
//!
//! Shields the request path from a failing store. One shared instance sits
//! in front of every bucket-engine call:
//!
//! - **Closed**: calls pass; consecutive failures are counted and any
//!   success resets the count. Hitting `failure_threshold` opens the
//!   circuit.
//! - **Open**: calls fail fast with `CircuitOpen` (the decisioner diverts to
//!   the fallback limiter) until `timeout` has elapsed; the first call after
//!   that is let through as a probe and the circuit moves to half-open.
//! - **Half-open**: probes pass. One failure re-opens with a fresh timeout;
//!   `success_threshold` consecutive successes close the circuit.
//!
//! The state machine is a few atomics; no locks are held across store
//! calls. State changes emit structured logs and the
//! `gatehouse_circuit_breaker_*` metrics.

use crate::error::{LimiterError, Result};
use gatehouse_core::now_ms;
use gatehouse_observability::metrics as obs;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::time::Duration;
use tracing::{info, warn};

const STATE_CLOSED: u8 = 0;
const STATE_HALF_OPEN: u8 = 1;
const STATE_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    HalfOpen,
    Open,
}

impl CircuitState {
    fn from_wire(value: u8) -> Self {
        match value {
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::HalfOpen => "half_open",
            CircuitState::Open => "open",
        }
    }

    /// Gauge encoding: 0=closed, 1=half-open, 2=open.
    pub fn metric_value(&self) -> i64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::HalfOpen => 1,
            CircuitState::Open => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures in the closed state that open the circuit.
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing.
    pub timeout: Duration,
    /// Consecutive half-open successes required to close.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_millis(60_000),
            success_threshold: 2,
        }
    }
}

/// Closed/open/half-open state machine around one resource.
pub struct CircuitBreaker {
    resource: String,
    config: CircuitBreakerConfig,
    state: AtomicU8,
    failures: AtomicU32,
    successes: AtomicU32,
    next_attempt_ms: AtomicI64,
}

impl CircuitBreaker {
    pub fn new(resource: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let resource = resource.into();
        obs::CIRCUIT_BREAKER_STATE
            .with_label_values(&[&resource])
            .set(0);
        Self {
            resource,
            config,
            state: AtomicU8::new(STATE_CLOSED),
            failures: AtomicU32::new(0),
            successes: AtomicU32::new(0),
            next_attempt_ms: AtomicI64::new(0),
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_wire(self.state.load(Ordering::Acquire))
    }

    /// Gate a call. `Ok` means proceed (and report the result back through
    /// `record_success`/`record_failure`); `Err(CircuitOpen)` means fail
    /// fast without touching the store.
    pub fn try_acquire(&self) -> Result<()> {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED | STATE_HALF_OPEN => Ok(()),
            _ => {
                if now_ms() >= self.next_attempt_ms.load(Ordering::Acquire) {
                    // First caller past the timeout becomes the probe.
                    if self
                        .state
                        .compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        self.successes.store(0, Ordering::Release);
                        self.on_transition(CircuitState::Open, CircuitState::HalfOpen);
                    }
                    Ok(())
                } else {
                    Err(LimiterError::CircuitOpen)
                }
            }
        }
    }

    pub fn record_success(&self) {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => {
                self.failures.store(0, Ordering::Release);
            }
            STATE_HALF_OPEN => {
                let successes = self.successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold
                    && self
                        .state
                        .compare_exchange(
                            STATE_HALF_OPEN,
                            STATE_CLOSED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.failures.store(0, Ordering::Release);
                    self.on_transition(CircuitState::HalfOpen, CircuitState::Closed);
                }
            }
            _ => {}
        }
    }

    pub fn record_failure(&self) {
        match self.state.load(Ordering::Acquire) {
            STATE_CLOSED => {
                let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold
                    && self
                        .state
                        .compare_exchange(
                            STATE_CLOSED,
                            STATE_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                {
                    self.arm_timeout();
                    self.on_transition(CircuitState::Closed, CircuitState::Open);
                }
            }
            STATE_HALF_OPEN => {
                if self
                    .state
                    .compare_exchange(
                        STATE_HALF_OPEN,
                        STATE_OPEN,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    self.arm_timeout();
                    self.on_transition(CircuitState::HalfOpen, CircuitState::Open);
                }
            }
            _ => {}
        }
    }

    fn arm_timeout(&self) {
        self.next_attempt_ms
            .store(now_ms() + self.config.timeout.as_millis() as i64, Ordering::Release);
    }

    fn on_transition(&self, from: CircuitState, to: CircuitState) {
        match to {
            CircuitState::Open => warn!(
                resource = %self.resource,
                from = from.as_str(),
                "circuit breaker opened"
            ),
            CircuitState::HalfOpen => info!(
                resource = %self.resource,
                "circuit breaker half-open, probing store"
            ),
            CircuitState::Closed => info!(
                resource = %self.resource,
                "circuit breaker closed, store recovered"
            ),
        }
        obs::CIRCUIT_BREAKER_STATE
            .with_label_values(&[&self.resource])
            .set(to.metric_value());
        obs::CIRCUIT_BREAKER_TRANSITIONS_TOTAL
            .with_label_values(&[&self.resource, from.as_str(), to.as_str()])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(timeout_ms: u64) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold: 3,
                timeout: Duration::from_millis(timeout_ms),
                success_threshold: 2,
            },
        )
    }

    #[test]
    fn opens_after_threshold_failures() {
        let cb = breaker(60_000);
        assert_eq!(cb.state(), CircuitState::Closed);

        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(cb.try_acquire(), Err(LimiterError::CircuitOpen)));
    }

    #[test]
    fn success_resets_closed_failure_count() {
        let cb = breaker(60_000);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn probes_after_timeout_and_closes_on_successes() {
        let cb = breaker(30);
        for _ in 0..3 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.try_acquire().is_err());

        tokio::time::sleep(Duration::from_millis(50)).await;

        // First caller after the timeout is the probe.
        assert!(cb.try_acquire().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let cb = breaker(30);
        for _ in 0..3 {
            cb.record_failure();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cb.try_acquire().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.try_acquire().is_err());
    }

    #[test]
    fn metric_encoding() {
        assert_eq!(CircuitState::Closed.metric_value(), 0);
        assert_eq!(CircuitState::HalfOpen.metric_value(), 1);
        assert_eq!(CircuitState::Open.metric_value(), 2);
    }
}
