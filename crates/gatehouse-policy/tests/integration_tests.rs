//! Cross-component laws of the policy layer: store and caches together.

use gatehouse_core::{
    now_ms, BucketPolicy, Override, OverrideSource, OverrideType, TenantPolicy, ThrottleConfig,
};
use gatehouse_policy::{
    OverrideCache, OverrideCacheConfig, PolicyCache, PolicyCacheConfig, PolicyStore,
    SqlitePolicyStore,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

fn tenant_policy(tenant: &str, rpm: u32) -> TenantPolicy {
    let mut policy = TenantPolicy::new(tenant, BucketPolicy::per_minute(rpm, rpm * 2));
    policy.user = Some(BucketPolicy {
        rpm: rpm / 10,
        rps: rpm as f64 / 10.0 / 60.0,
        burst_capacity: rpm / 5,
        refill_rate_per_sec: None,
    });
    policy.throttle = ThrottleConfig::new(110.0, Some(100.0));
    policy
}

fn override_shape(
    id: &str,
    tenant: &str,
    user: Option<&str>,
    endpoint: Option<&str>,
) -> Override {
    Override {
        id: id.to_string(),
        tenant_id: tenant.to_string(),
        user_id: user.map(String::from),
        endpoint: endpoint.map(String::from),
        override_type: OverrideType::PenaltyMultiplier,
        penalty_multiplier: Some(0.5),
        custom_rate: None,
        custom_burst: None,
        reason: "integration".to_string(),
        source: OverrideSource::ManualOperator,
        created_at: now_ms(),
        expires_at: now_ms() + 60_000,
    }
}

/// upsert(policy) → get(tenant_id) returns an equivalent policy with the
/// derived refill rate filled in, through the store and through the cache.
#[tokio::test]
async fn upsert_then_get_is_equivalent_and_normalised() {
    let store = Arc::new(SqlitePolicyStore::new_in_memory().await.unwrap());
    let cache = PolicyCache::new(store.clone(), PolicyCacheConfig::default());

    let submitted = tenant_policy("acme", 6000);
    assert!(submitted.user.as_ref().unwrap().refill_rate_per_sec.is_none());
    store.upsert_tenant(submitted.clone()).await.unwrap();

    for loaded in [
        store.get_tenant("acme").await.unwrap().unwrap(),
        cache.get_tenant("acme").await.unwrap().unwrap(),
    ] {
        assert_eq!(loaded.tenant_id, submitted.tenant_id);
        assert_eq!(loaded.tenant.rpm, submitted.tenant.rpm);
        assert_eq!(loaded.throttle, submitted.throttle);
        // Normalisation filled the derived rate.
        let user = loaded.user.unwrap();
        assert!((user.refill_rate_per_sec.unwrap() - 10.0).abs() < 1e-9);
    }
}

/// Within one cache TTL of a policy update, readers see the new policy,
/// with or without the change-event worker running.
#[tokio::test]
async fn cache_coherence_within_ttl() {
    let store = Arc::new(SqlitePolicyStore::new_in_memory().await.unwrap());
    let ttl_ms = 100;
    let cache = Arc::new(PolicyCache::new(
        store.clone(),
        PolicyCacheConfig {
            ttl_ms,
            ..Default::default()
        },
    ));

    store.upsert_tenant(tenant_policy("acme", 600)).await.unwrap();
    assert_eq!(
        cache.get_tenant("acme").await.unwrap().unwrap().tenant.rpm,
        600
    );

    // TTL-only path: mutate the store directly, wait out the TTL.
    store.upsert_tenant(tenant_policy("acme", 1200)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(ttl_ms as u64 + 50)).await;
    assert_eq!(
        cache.get_tenant("acme").await.unwrap().unwrap().tenant.rpm,
        1200
    );

    // Event path: with the worker running, convergence beats the TTL.
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let handle = cache.clone().start(shutdown_rx);
    store.upsert_tenant(tenant_policy("acme", 2400)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(
        cache.get_tenant("acme").await.unwrap().unwrap().tenant.rpm,
        2400
    );
    shutdown_tx.send(()).unwrap();
    handle.await.unwrap();
}

/// The four override shapes resolve by precedence through the cache, and
/// removing the winner promotes the next most specific shape once its keys
/// are invalidated.
#[tokio::test]
async fn precedence_ladder_through_the_cache() {
    let store = Arc::new(SqlitePolicyStore::new_in_memory().await.unwrap());
    // Short TTL: a deletion's shape-key eviction does not touch entries
    // cached under other request shapes, so promotion to the next rung
    // becomes visible once those age out.
    let cache = OverrideCache::new(
        store.clone(),
        OverrideCacheConfig {
            ttl_ms: 50,
            ..Default::default()
        },
    );

    store
        .create_override(override_shape("tenant-wide", "acme", None, None))
        .await
        .unwrap();
    store
        .create_override(override_shape("endpoint", "acme", None, Some("/api/x")))
        .await
        .unwrap();
    store
        .create_override(override_shape("user", "acme", Some("alice"), None))
        .await
        .unwrap();
    store
        .create_override(override_shape(
            "user-endpoint",
            "acme",
            Some("alice"),
            Some("/api/x"),
        ))
        .await
        .unwrap();

    let ladder = [
        ("user-endpoint", Some("alice"), Some("/api/x")),
        ("user", Some("alice"), None),
        ("endpoint", None, Some("/api/x")),
        ("tenant-wide", None, None),
    ];

    for (expect, user, endpoint) in ladder {
        let winner = cache
            .get_active("acme", "alice", "/api/x")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(winner.id, expect);

        let deleted = store.delete_override(expect).await.unwrap();
        assert_eq!(deleted.user_id.as_deref(), user);
        assert_eq!(deleted.endpoint.as_deref(), endpoint);
        cache.invalidate("acme", user, endpoint).await;
        tokio::time::sleep(Duration::from_millis(80)).await;
    }

    assert!(cache
        .get_active("acme", "alice", "/api/x")
        .await
        .unwrap()
        .is_none());
}

/// Creating then deleting an override leaves the effective lookup result
/// unchanged once the cached entries age out.
#[tokio::test]
async fn override_create_delete_roundtrip() {
    let store = Arc::new(SqlitePolicyStore::new_in_memory().await.unwrap());
    let cache = OverrideCache::new(
        store.clone(),
        OverrideCacheConfig {
            ttl_ms: 60,
            ..Default::default()
        },
    );

    assert!(cache
        .get_active("acme", "alice", "/api/x")
        .await
        .unwrap()
        .is_none());

    store
        .create_override(override_shape("penalty", "acme", None, None))
        .await
        .unwrap();
    cache.invalidate("acme", None, None).await;
    tokio::time::sleep(Duration::from_millis(90)).await; // age out the None
    assert!(cache
        .get_active("acme", "alice", "/api/x")
        .await
        .unwrap()
        .is_some());

    store.delete_override("penalty").await.unwrap();
    cache.invalidate("acme", None, None).await;
    tokio::time::sleep(Duration::from_millis(90)).await; // age out the Some
    assert!(cache
        .get_active("acme", "alice", "/api/x")
        .await
        .unwrap()
        .is_none());
}

/// The sweep is what actually removes expired rows; reads only filter.
#[tokio::test]
async fn sweep_completes_store_enforced_expiry() {
    let store = Arc::new(SqlitePolicyStore::new_in_memory().await.unwrap());

    let mut short = override_shape("short", "acme", None, None);
    short.expires_at = now_ms() + 40;
    store.create_override(short).await.unwrap();

    tokio::time::sleep(Duration::from_millis(70)).await;
    assert!(store.list_overrides("acme").await.unwrap().is_empty());
    assert_eq!(store.purge_expired_overrides().await.unwrap(), 1);
}
