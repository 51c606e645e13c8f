//! Atomic Token-Bucket Primitive
//!
//! The bucket algorithm runs entirely server-side as one Lua script so that
//! two workers hitting the same bucket in the same millisecond cannot both
//! consume the last token. Bucket state is two hash fields,
//! `(tokens, last_refill_ms)`, created lazily at full capacity and expired
//! on a TTL refreshed at every consumption so churned identities do not
//! accumulate.
//!
//! ## The algorithm
//!
//! 1. Load `(tokens, last_refill_ms)`; initialise to `(capacity, now)` when
//!    absent.
//! 2. Refill: `tokens = min(capacity, tokens + elapsed_s * refill_rate)`.
//! 3. Classify usage `(capacity - tokens) / capacity * 100` against the
//!    soft/hard thresholds: at or above hard → deny, at or above soft →
//!    warn, else normal.
//! 4. When allowed, tentatively consume one token; if that pushes usage to
//!    or past the hard threshold the token is refunded and the request is
//!    denied (no single evaluation may itself cross the hard line).
//! 5. Persist and refresh the TTL only on consumption; denied requests do
//!    not mutate the store.
//!
//! Returns `{allowed, state, floor(tokens), floor(usage)}` with
//! `state ∈ {0=normal, 1=soft, 2=hard}`.
//!
//! This module also owns the pure math derived from a verdict: reset-epoch
//! and retry-after. Both the Redis engine and the in-process backend share
//! them so every backend reports identical numbers.

use gatehouse_core::ThrottleState;

/// Lua source of the atomic bucket primitive.
///
/// `KEYS[1]` = bucket key;
/// `ARGV` = capacity, refill_rate_per_sec, now_ms, soft_pct, hard_pct, ttl_s.
pub const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local capacity = tonumber(ARGV[1])
local refill_rate = tonumber(ARGV[2])
local now_ms = tonumber(ARGV[3])
local soft_pct = tonumber(ARGV[4])
local hard_pct = tonumber(ARGV[5])
local ttl_s = tonumber(ARGV[6])

local state = redis.call('HMGET', key, 'tokens', 'last_refill_ms')
local tokens = tonumber(state[1])
local last_refill_ms = tonumber(state[2])
if tokens == nil or last_refill_ms == nil then
  tokens = capacity
  last_refill_ms = now_ms
end

local elapsed = (now_ms - last_refill_ms) / 1000
if elapsed < 0 then
  elapsed = 0
end
tokens = math.min(capacity, tokens + elapsed * refill_rate)
last_refill_ms = now_ms

local usage = (capacity - tokens) / capacity * 100

local allowed = 1
local bucket_state = 0
if usage >= hard_pct then
  allowed = 0
  bucket_state = 2
elseif usage >= soft_pct then
  bucket_state = 1
end

if allowed == 1 then
  tokens = tokens - 1
  local usage_after = (capacity - tokens) / capacity * 100
  if usage_after >= hard_pct then
    tokens = tokens + 1
    allowed = 0
    bucket_state = 2
  end
end

if allowed == 1 then
  redis.call('HSET', key, 'tokens', tokens, 'last_refill_ms', last_refill_ms)
  redis.call('EXPIRE', key, ttl_s)
end

local usage_final = (capacity - tokens) / capacity * 100
return {allowed, bucket_state, math.floor(tokens), math.floor(usage_final)}
"#;

/// Per-check parameters handed to the primitive.
#[derive(Debug, Clone, PartialEq)]
pub struct BucketParams {
    pub capacity: u32,
    pub refill_rate_per_sec: f64,
    pub soft_pct: f64,
    pub hard_pct: f64,
    pub ttl_s: u64,
}

/// Decoded result of one primitive invocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketVerdict {
    pub allowed: bool,
    pub state: ThrottleState,
    pub tokens: i64,
    pub usage_pct: i64,
}

impl BucketVerdict {
    /// Decode the `[allowed, state, tokens, usage]` wire tuple.
    pub fn from_wire(raw: (i64, i64, i64, i64)) -> Self {
        Self {
            allowed: raw.0 == 1,
            state: ThrottleState::from_wire(raw.1),
            tokens: raw.2,
            usage_pct: raw.3,
        }
    }
}

/// Epoch second at which a bucket at `tokens` refills completely, assuming
/// no further consumption. Rounded up.
pub fn reset_epoch_s(now_ms: i64, tokens: i64, capacity: u32, refill_rate_per_sec: f64) -> i64 {
    let missing = (capacity as f64 - tokens as f64).max(0.0);
    let refill_ms = missing / refill_rate_per_sec * 1000.0;
    ((now_ms as f64 + refill_ms) / 1000.0).ceil() as i64
}

/// Seconds until one more token can be consumed without landing at or past
/// the hard threshold. Zero when that is already possible.
pub fn retry_after_s(tokens: i64, capacity: u32, refill_rate_per_sec: f64, hard_pct: f64) -> u64 {
    let consumed = capacity as f64 - tokens as f64;
    let max_consumed_at_hard = capacity as f64 * hard_pct / 100.0;
    let deficit = consumed + 1.0 - max_consumed_at_hard;
    if deficit <= 0.0 {
        0
    } else {
        (deficit / refill_rate_per_sec).ceil() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_decodes_wire_tuple() {
        let verdict = BucketVerdict::from_wire((1, 0, 1999, 0));
        assert!(verdict.allowed);
        assert_eq!(verdict.state, ThrottleState::Normal);
        assert_eq!(verdict.tokens, 1999);

        let verdict = BucketVerdict::from_wire((0, 2, 0, 100));
        assert!(!verdict.allowed);
        assert_eq!(verdict.state, ThrottleState::Hard);
    }

    #[test]
    fn reset_epoch_full_bucket_is_now() {
        // Nothing missing: reset is now, rounded up to the next second.
        assert_eq!(reset_epoch_s(10_000, 100, 100, 10.0), 10);
        assert_eq!(reset_epoch_s(10_500, 100, 100, 10.0), 11);
    }

    #[test]
    fn reset_epoch_accounts_for_missing_tokens() {
        // 50 tokens missing at 10/s = 5 s to full.
        assert_eq!(reset_epoch_s(10_000, 50, 100, 10.0), 15);
        // Fractional refill rounds up.
        assert_eq!(reset_epoch_s(10_000, 99, 100, 3.0), 11);
    }

    #[test]
    fn retry_after_zero_when_consumable() {
        // Empty-ish bucket but hard at 110%: one more consumption cannot
        // cross the line, so no wait is required.
        assert_eq!(retry_after_s(14, 15, 1.0, 110.0), 0);
    }

    #[test]
    fn retry_after_counts_refill_time() {
        // capacity 15, hard 105% → max consumed 15.75. With 0 tokens left,
        // consuming one more lands at 16 > 15.75: wait for 0.25 tokens at
        // 10/60 per second = 1.5 s → 2 s.
        assert_eq!(retry_after_s(0, 15, 10.0 / 60.0, 105.0), 2);
    }

    #[test]
    fn retry_after_at_hard_100() {
        // hard=100%: with the bucket empty the next token must fully refill.
        assert_eq!(retry_after_s(0, 10, 1.0, 100.0), 1);
        assert_eq!(retry_after_s(0, 10, 0.1, 100.0), 10);
    }
}
