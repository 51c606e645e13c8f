//! Policy Caching Layer
//!
//! Every request resolves its tenant policy before any bucket is touched, so
//! the policy store would be on the hot path of every decision without a
//! cache in front of it.
//!
//! ## What gets cached
//!
//! - **Tenant policies**: bounded LRU (10,000 entries) with a 60 s TTL.
//!   `get_tenant` is cache-first; misses load from the store, normalise the
//!   derived refill rates, and insert.
//! - **Global policy**: a single slot with the same TTL.
//!
//! ## How entries stay fresh
//!
//! Three mechanisms, layered:
//!
//! 1. **TTL**: the backstop. No entry outlives `ttl_ms`.
//! 2. **Background refresh**: every `refresh_interval` the cache re-reads
//!    every currently resident tenant and *replaces* entries (it does not
//!    evict on refresh failure: stale-but-present beats absent while the
//!    store is unhappy). Tenants the store no longer knows are evicted.
//! 3. **Change events**: the store broadcasts mutations; the cache worker
//!    invalidates the affected tenant (or the global slot) immediately. If
//!    the worker falls behind the channel it drops the whole cache once and
//!    relies on the TTL from there.
//!
//! Hit/miss counts are tracked locally for tests and mirrored to the
//! Prometheus registry (`gatehouse_policy_cache_*`).

use crate::{error::Result, PolicyChange, PolicyStore};
use gatehouse_core::{now_ms, GlobalPolicy, TenantPolicy};
use gatehouse_observability::metrics as obs;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Cache entry with TTL
struct CacheEntry<T> {
    value: T,
    expires_at: i64,
}

impl<T> CacheEntry<T> {
    fn new(value: T, ttl_ms: i64) -> Self {
        Self {
            value,
            expires_at: now_ms() + ttl_ms,
        }
    }

    fn is_expired(&self) -> bool {
        now_ms() >= self.expires_at
    }
}

/// Configuration for the policy caching layer
#[derive(Debug, Clone)]
pub struct PolicyCacheConfig {
    /// TTL for cached policies (milliseconds)
    pub ttl_ms: i64,
    /// Maximum number of tenant policies to cache
    pub max_size: usize,
    /// How often the resident set is re-read from the store
    pub refresh_interval: Duration,
}

impl Default for PolicyCacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 60_000,
            max_size: 10_000,
            refresh_interval: Duration::from_secs(30),
        }
    }
}

/// Cache performance counters
#[derive(Debug, Default)]
pub struct PolicyCacheMetrics {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
}

impl PolicyCacheMetrics {
    /// Hit rate in 0.0 - 1.0, zero before any lookup.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;
        let total = hits + misses;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }
}

/// LRU + TTL cache in front of a [`PolicyStore`].
pub struct PolicyCache {
    store: Arc<dyn PolicyStore>,
    config: PolicyCacheConfig,
    tenants: RwLock<LruCache<String, CacheEntry<TenantPolicy>>>,
    global: RwLock<Option<CacheEntry<GlobalPolicy>>>,
    metrics: PolicyCacheMetrics,
}

impl PolicyCache {
    pub fn new(store: Arc<dyn PolicyStore>, config: PolicyCacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_size.max(1)).expect("capacity is nonzero");
        Self {
            store,
            config,
            tenants: RwLock::new(LruCache::new(capacity)),
            global: RwLock::new(None),
            metrics: PolicyCacheMetrics::default(),
        }
    }

    pub fn metrics(&self) -> &PolicyCacheMetrics {
        &self.metrics
    }

    fn record_hit(&self) {
        self.metrics.hits.fetch_add(1, Ordering::Relaxed);
        obs::POLICY_CACHE_HITS_TOTAL.inc();
        obs::POLICY_CACHE_HIT_RATIO.set(self.metrics.hit_rate());
    }

    fn record_miss(&self) {
        self.metrics.misses.fetch_add(1, Ordering::Relaxed);
        obs::POLICY_CACHE_MISSES_TOTAL.inc();
        obs::POLICY_CACHE_HIT_RATIO.set(self.metrics.hit_rate());
    }

    /// Resolve one tenant's policy, cache-first.
    pub async fn get_tenant(&self, tenant_id: &str) -> Result<Option<TenantPolicy>> {
        {
            let mut cache = self.tenants.write().await;
            if let Some(entry) = cache.get(tenant_id) {
                if !entry.is_expired() {
                    self.record_hit();
                    return Ok(Some(entry.value.clone()));
                }
                cache.pop(tenant_id);
            }
        }

        self.record_miss();
        let policy = self.store.get_tenant(tenant_id).await?;

        if let Some(mut policy) = policy {
            policy.normalize();
            let entry = CacheEntry::new(policy.clone(), self.config.ttl_ms);
            self.tenants
                .write()
                .await
                .put(tenant_id.to_string(), entry);
            return Ok(Some(policy));
        }

        Ok(None)
    }

    /// Resolve the global policy, cache-first. `Ok(None)` when none has been
    /// provisioned; the decisioner substitutes a permissive default.
    pub async fn get_global(&self) -> Result<Option<GlobalPolicy>> {
        {
            let slot = self.global.read().await;
            if let Some(entry) = slot.as_ref() {
                if !entry.is_expired() {
                    return Ok(Some(entry.value.clone()));
                }
            }
        }

        let policy = self.store.get_global().await?;
        if let Some(mut policy) = policy {
            policy.normalize();
            *self.global.write().await = Some(CacheEntry::new(policy.clone(), self.config.ttl_ms));
            return Ok(Some(policy));
        }

        *self.global.write().await = None;
        Ok(None)
    }

    pub async fn invalidate_tenant(&self, tenant_id: &str) {
        self.tenants.write().await.pop(tenant_id);
    }

    pub async fn invalidate_global(&self) {
        *self.global.write().await = None;
    }

    pub async fn clear(&self) {
        self.tenants.write().await.clear();
        *self.global.write().await = None;
    }

    /// Re-read every resident tenant and replace its entry with a fresh TTL.
    /// Refresh failures keep the stale entry; a not-found response evicts.
    pub async fn refresh_resident(&self) {
        let resident: Vec<String> = {
            let cache = self.tenants.read().await;
            cache.iter().map(|(k, _)| k.clone()).collect()
        };

        if resident.is_empty() {
            return;
        }
        debug!(count = resident.len(), "refreshing resident tenant policies");

        for tenant_id in resident {
            match self.store.get_tenant(&tenant_id).await {
                Ok(Some(mut policy)) => {
                    policy.normalize();
                    let entry = CacheEntry::new(policy, self.config.ttl_ms);
                    self.tenants.write().await.put(tenant_id, entry);
                }
                Ok(None) => {
                    self.tenants.write().await.pop(&tenant_id);
                }
                Err(e) => {
                    warn!(tenant_id = %tenant_id, error = %e, "policy refresh failed; serving stale entry");
                }
            }
        }
    }

    async fn handle_change(&self, change: PolicyChange) {
        match change.tenant_id {
            Some(tenant_id) => {
                debug!(tenant_id = %tenant_id, kind = ?change.kind, "invalidating tenant policy");
                self.invalidate_tenant(&tenant_id).await;
            }
            None => {
                debug!(kind = ?change.kind, "invalidating global policy");
                self.invalidate_global().await;
            }
        }
    }

    /// Start the refresh loop and the change-event worker. Returns the task
    /// handle; send on `shutdown_rx`'s peer to stop.
    pub fn start(self: Arc<Self>, shutdown_rx: oneshot::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.refresh_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut events = self.store.subscribe();
            let mut events_open = true;
            let mut shutdown_rx = shutdown_rx;

            info!(
                refresh_interval = ?self.config.refresh_interval,
                ttl_ms = self.config.ttl_ms,
                "policy cache refresh started"
            );

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.refresh_resident().await;
                    }
                    event = events.recv(), if events_open => match event {
                        Ok(change) => self.handle_change(change).await,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "policy change stream lagged; dropping cache");
                            self.clear().await;
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            // Store dropped its sender; TTL consistency from here.
                            events_open = false;
                        }
                    },
                    _ = &mut shutdown_rx => {
                        info!("policy cache refresh shutting down");
                        break;
                    }
                }
            }
        })
    }
}
