//! Bucket Engine
//!
//! Client side of the atomic primitive: loads the script into the store on
//! connect, dispatches single and batched evaluations, and maps transport
//! failures into the limiter error taxonomy.
//!
//! ## Partitioning contract
//!
//! Keys carrying a `{tenant:...}` hash tag collocate on one storage
//! partition, so the decisioner hands them over as one `check_batch` call;
//! untagged (global) keys arrive as individual `check` calls dispatched in
//! parallel. Batched invocations share the multiplexed connection, which
//! pipelines them without any cross-partition assumptions.
//!
//! ## Script lifecycle
//!
//! The script SHA is computed at construction and the source is loaded with
//! `SCRIPT LOAD` on connect. If the server later loses it (restart,
//! `SCRIPT FLUSH`), the invocation path reloads from source and retries
//! exactly once; a second miss surfaces as a store error.

use crate::error::{LimiterError, Result};
use crate::script::{BucketParams, BucketVerdict, TOKEN_BUCKET_SCRIPT};
use async_trait::async_trait;
use gatehouse_core::now_ms;
use redis::aio::ConnectionManager;
use redis::Script;
use std::time::Duration;
use tracing::{debug, info};

/// Storage abstraction for the atomic bucket primitive.
///
/// The production implementation is [`RedisBucketEngine`]; tests and
/// single-node deployments use
/// [`MemoryBucketBackend`](crate::memory::MemoryBucketBackend). Both honour
/// the same algorithm, so decisions are backend-independent.
#[async_trait]
pub trait BucketBackend: Send + Sync {
    /// Evaluate one bucket.
    async fn check(&self, key: &str, params: &BucketParams) -> Result<BucketVerdict>;

    /// Evaluate a group of buckets that share a storage partition. Results
    /// come back in input order.
    async fn check_batch(&self, checks: &[(String, BucketParams)]) -> Result<Vec<BucketVerdict>>;
}

/// Redis-backed bucket engine.
pub struct RedisBucketEngine {
    manager: ConnectionManager,
    script: Script,
    timeout: Duration,
}

impl RedisBucketEngine {
    /// Connect to the store and load the bucket script.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| LimiterError::StoreUnavailable(format!("redis client: {e}")))?;
        let manager = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| LimiterError::StoreTimeout)?
            .map_err(|e| LimiterError::StoreUnavailable(format!("redis connect: {e}")))?;

        let script = Script::new(TOKEN_BUCKET_SCRIPT);

        // Preload so the first request does not pay the NOSCRIPT round trip.
        let mut conn = manager.clone();
        let sha: String = tokio::time::timeout(
            timeout,
            redis::cmd("SCRIPT")
                .arg("LOAD")
                .arg(TOKEN_BUCKET_SCRIPT)
                .query_async(&mut conn),
        )
        .await
        .map_err(|_| LimiterError::StoreTimeout)??;

        info!(sha = %sha, "bucket script loaded");
        Ok(Self {
            manager,
            script,
            timeout,
        })
    }

    async fn invoke(&self, key: &str, params: &BucketParams) -> Result<BucketVerdict> {
        let mut conn = self.manager.clone();

        // `Script` issues EVALSHA and falls back to loading the source on a
        // NOSCRIPT reply: the reload-and-retry-once contract.
        let raw: (i64, i64, i64, i64) = tokio::time::timeout(
            self.timeout,
            self.script
                .key(key)
                .arg(params.capacity)
                .arg(params.refill_rate_per_sec)
                .arg(now_ms())
                .arg(params.soft_pct)
                .arg(params.hard_pct)
                .arg(params.ttl_s)
                .invoke_async(&mut conn),
        )
        .await
        .map_err(|_| LimiterError::StoreTimeout)??;

        Ok(BucketVerdict::from_wire(raw))
    }
}

#[async_trait]
impl BucketBackend for RedisBucketEngine {
    async fn check(&self, key: &str, params: &BucketParams) -> Result<BucketVerdict> {
        self.invoke(key, params).await
    }

    async fn check_batch(&self, checks: &[(String, BucketParams)]) -> Result<Vec<BucketVerdict>> {
        debug!(count = checks.len(), "dispatching bucket batch");
        let futures = checks
            .iter()
            .map(|(key, params)| self.invoke(key, params));
        futures::future::try_join_all(futures).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatehouse_core::ThrottleState;

    fn params(capacity: u32, rpm: u32) -> BucketParams {
        BucketParams {
            capacity,
            refill_rate_per_sec: rpm as f64 / 60.0,
            soft_pct: 100.0,
            hard_pct: 110.0,
            ttl_s: 3600,
        }
    }

    // Exercises a real store; run with `cargo test -- --ignored` against a
    // local Redis.
    #[tokio::test]
    #[ignore = "requires a running Redis at localhost:6379"]
    async fn script_roundtrip_against_redis() {
        let engine = RedisBucketEngine::connect("redis://127.0.0.1/", Duration::from_millis(500))
            .await
            .unwrap();

        let key = format!("{{tenant:test-{}}}:bucket", now_ms());
        let verdict = engine.check(&key, &params(2000, 1000)).await.unwrap();
        assert!(verdict.allowed);
        assert_eq!(verdict.state, ThrottleState::Normal);
        assert_eq!(verdict.tokens, 1999);
    }

    #[tokio::test]
    #[ignore = "requires a running Redis at localhost:6379"]
    async fn batch_preserves_order_against_redis() {
        let engine = RedisBucketEngine::connect("redis://127.0.0.1/", Duration::from_millis(500))
            .await
            .unwrap();

        let tag = now_ms();
        let checks = vec![
            (format!("{{tenant:t{tag}}}:user:alice:bucket"), params(10, 10)),
            (format!("{{tenant:t{tag}}}:bucket"), params(100, 100)),
        ];
        let verdicts = engine.check_batch(&checks).await.unwrap();
        assert_eq!(verdicts.len(), 2);
        assert_eq!(verdicts[0].tokens, 9);
        assert_eq!(verdicts[1].tokens, 99);
    }
}
