//! In-Process Bucket Backend
//!
//! A mutex-held mirror of the store-side primitive. It exists for two
//! reasons: single-node deployments that have no Redis, and deterministic
//! tests, where the clock is injectable, so refill behaviour can be driven
//! without sleeping.
//!
//! The algorithm is identical to the Lua script in [`crate::script`],
//! including lazy initialisation at full capacity, the post-consumption
//! overshoot guard, no-mutation-on-deny, and per-key TTL (checked lazily on
//! access).

use crate::engine::BucketBackend;
use crate::error::Result;
use crate::script::{BucketParams, BucketVerdict};
use async_trait::async_trait;
use gatehouse_core::ThrottleState;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

/// Millisecond clock abstraction so bucket timing can be driven in tests.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Wall-clock time.
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        gatehouse_core::now_ms()
    }
}

/// Manually advanced clock for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(now_ms),
        }
    }

    pub fn advance_ms(&self, delta: i64) {
        self.now.fetch_add(delta, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

struct BucketState {
    tokens: f64,
    last_refill_ms: i64,
    expires_at_ms: i64,
}

/// In-memory implementation of the atomic bucket primitive.
pub struct MemoryBucketBackend {
    buckets: Mutex<HashMap<String, BucketState>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryBucketBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBucketBackend {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            clock,
        }
    }

    fn evaluate(&self, key: &str, params: &BucketParams) -> BucketVerdict {
        let now_ms = self.clock.now_ms();
        let capacity = params.capacity as f64;
        let mut buckets = self.buckets.lock().expect("bucket map lock");

        let (mut tokens, last_refill_ms) = match buckets.get(key) {
            Some(state) if state.expires_at_ms > now_ms => (state.tokens, state.last_refill_ms),
            _ => (capacity, now_ms),
        };

        let elapsed_s = ((now_ms - last_refill_ms) as f64 / 1000.0).max(0.0);
        tokens = (tokens + elapsed_s * params.refill_rate_per_sec).min(capacity);

        let usage = (capacity - tokens) / capacity * 100.0;

        let mut allowed = true;
        let mut state = ThrottleState::Normal;
        if usage >= params.hard_pct {
            allowed = false;
            state = ThrottleState::Hard;
        } else if usage >= params.soft_pct {
            state = ThrottleState::Soft;
        }

        if allowed {
            tokens -= 1.0;
            let usage_after = (capacity - tokens) / capacity * 100.0;
            if usage_after >= params.hard_pct {
                // Overshoot guard: refund, deny.
                tokens += 1.0;
                allowed = false;
                state = ThrottleState::Hard;
            }
        }

        if allowed {
            buckets.insert(
                key.to_string(),
                BucketState {
                    tokens,
                    last_refill_ms: now_ms,
                    expires_at_ms: now_ms + params.ttl_s as i64 * 1000,
                },
            );
        }

        let usage_final = (capacity - tokens) / capacity * 100.0;
        BucketVerdict {
            allowed,
            state,
            tokens: tokens.floor() as i64,
            usage_pct: usage_final.floor() as i64,
        }
    }
}

#[async_trait]
impl BucketBackend for MemoryBucketBackend {
    async fn check(&self, key: &str, params: &BucketParams) -> Result<BucketVerdict> {
        Ok(self.evaluate(key, params))
    }

    async fn check_batch(&self, checks: &[(String, BucketParams)]) -> Result<Vec<BucketVerdict>> {
        Ok(checks
            .iter()
            .map(|(key, params)| self.evaluate(key, params))
            .collect())
    }
}
