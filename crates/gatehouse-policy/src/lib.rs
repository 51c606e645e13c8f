//! Gatehouse Policy Store
//!
//! This crate owns everything between the decision pipeline and durable
//! policy state:
//!
//! - **`PolicyStore`**: the storage trait for tenant/global policies and
//!   overrides, including the change-event subscription
//! - **`SqlitePolicyStore`**: the SQLite implementation (sqlx)
//! - **`PolicyCache`**: LRU + TTL cache with background refresh and
//!   change-event invalidation
//! - **`OverrideCache`**: precedence-resolving override lookup cache with
//!   negative caching
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   cache-first   ┌─────────────┐   sqlx    ┌──────────┐
//! │ Decisioner │ ──────────────→ │ PolicyCache │ ────────→ │  SQLite  │
//! └────────────┘                 └──────┬──────┘           └────┬─────┘
//!                                       │  invalidations        │
//!                                       └──── change events ────┘
//! ```
//!
//! ## Consistency model
//!
//! Writes go straight to the store; the store broadcasts a change event that
//! the cache's worker turns into an invalidation. Entries also expire on a
//! TTL (60 s default) and the whole resident set is re-read every 30 s, so a
//! deployment whose store cannot emit events still converges within one TTL.

pub mod cache;
pub mod error;
pub mod override_cache;
pub mod sqlite;

pub use cache::{PolicyCache, PolicyCacheConfig, PolicyCacheMetrics};
pub use error::{PolicyError, Result};
pub use override_cache::{OverrideCache, OverrideCacheConfig};
pub use sqlite::SqlitePolicyStore;

use async_trait::async_trait;
use gatehouse_core::{GlobalPolicy, Override, TenantPolicy};
use tokio::sync::broadcast;

/// What happened to a policy document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// A change notification from the policy store. `tenant_id` of `None` means
/// the global policy changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyChange {
    pub tenant_id: Option<String>,
    pub kind: ChangeKind,
}

/// Storage abstraction for policies and overrides.
///
/// Implementations must be `Send + Sync` so they can be shared as
/// `Arc<dyn PolicyStore>` across workers and background jobs.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    // ============================================================
    // TENANT POLICIES
    // ============================================================

    /// Fetch one tenant's policy. `Ok(None)` when the tenant has none.
    async fn get_tenant(&self, tenant_id: &str) -> Result<Option<TenantPolicy>>;

    /// Create or replace a tenant policy. The policy is validated and
    /// normalised (derived refill rates filled in) before it is written.
    async fn upsert_tenant(&self, policy: TenantPolicy) -> Result<()>;

    /// Remove a tenant policy. Errors with `TenantNotFound` when absent.
    async fn delete_tenant(&self, tenant_id: &str) -> Result<()>;

    /// All tenant policies, for the cache refresh loop and the admin API.
    async fn list_tenants(&self) -> Result<Vec<TenantPolicy>>;

    // ============================================================
    // GLOBAL POLICY
    // ============================================================

    async fn get_global(&self) -> Result<Option<GlobalPolicy>>;

    async fn upsert_global(&self, policy: GlobalPolicy) -> Result<()>;

    // ============================================================
    // OVERRIDES
    // ============================================================

    /// Persist a new override. Validated (future expiry, type fields)
    /// before the write.
    async fn create_override(&self, override_doc: Override) -> Result<()>;

    /// Delete an override by id, returning the deleted document so callers
    /// can invalidate the cache shapes it covered.
    async fn delete_override(&self, id: &str) -> Result<Override>;

    /// Every override for a tenant that has not yet expired.
    async fn list_overrides(&self, tenant_id: &str) -> Result<Vec<Override>>;

    /// Unexpired overrides whose shape could govern a request by
    /// `(tenant_id, user_id, endpoint)`: exact user+endpoint, user-only,
    /// endpoint-only, or tenant-wide. Precedence ranking happens in memory
    /// on the caller's side.
    async fn active_overrides(
        &self,
        tenant_id: &str,
        user_id: Option<&str>,
        endpoint: Option<&str>,
    ) -> Result<Vec<Override>>;

    /// Drop overrides whose `expires_at` has passed. Returns the number of
    /// rows removed. Backends with native TTL indexes may make this a
    /// no-op.
    async fn purge_expired_overrides(&self) -> Result<u64>;

    // ============================================================
    // CHANGE EVENTS
    // ============================================================

    /// Subscribe to policy change events. Receivers that fall behind see a
    /// `Lagged` error and should fall back to TTL consistency.
    fn subscribe(&self) -> broadcast::Receiver<PolicyChange>;
}
