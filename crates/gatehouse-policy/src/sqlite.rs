//! SQLite Policy Store Implementation
//!
//! Policies and overrides are stored as JSON documents with the columns the
//! queries need lifted out alongside. SQLite keeps single-node deployments
//! zero-config; the `PolicyStore` trait keeps the door open for a
//! server-grade backend later.
//!
//! ## Schema
//!
//! - `tenant_policies(tenant_id PK, document, created_at, updated_at)`
//! - `global_policy(id=1, document, updated_at)`: a singleton row
//! - `overrides(id PK, tenant_id, user_id?, endpoint?, document, expires_at)`
//!   with indexes on `(tenant_id, expires_at)` and `(expires_at)`
//!
//! ## Expiration
//!
//! SQLite has no TTL index, so every override read filters on
//! `expires_at > now` and a periodic sweep deletes the expired rows. The
//! combination behaves like store-enforced expiration from the outside.
//!
//! ## Change events
//!
//! Each mutation broadcasts a [`PolicyChange`] after the write commits. The
//! channel is best-effort: with no subscribers the event is dropped, and a
//! lagged subscriber falls back to TTL consistency.

use crate::{
    error::{PolicyError, Result},
    ChangeKind, PolicyChange, PolicyStore,
};
use async_trait::async_trait;
use gatehouse_core::{now_ms, GlobalPolicy, Override, TenantPolicy};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::str::FromStr;
use tokio::sync::broadcast;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tenant_policies (
    tenant_id  TEXT PRIMARY KEY,
    document   TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS global_policy (
    id         INTEGER PRIMARY KEY CHECK (id = 1),
    document   TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS overrides (
    id         TEXT PRIMARY KEY,
    tenant_id  TEXT NOT NULL,
    user_id    TEXT,
    endpoint   TEXT,
    document   TEXT NOT NULL,
    expires_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_overrides_tenant ON overrides (tenant_id, expires_at);
CREATE INDEX IF NOT EXISTS idx_overrides_expiry ON overrides (expires_at);
"#;

/// Capacity of the change-event channel; slow subscribers past this lag are
/// told so and re-sync via TTL.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// SQLite-backed policy store.
pub struct SqlitePolicyStore {
    pool: SqlitePool,
    events: broadcast::Sender<PolicyChange>,
}

impl SqlitePolicyStore {
    /// Open (or create) a policy database at `path`.
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let options =
            SqliteConnectOptions::from_str(&format!("sqlite://{}", path.as_ref().display()))?
                .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;

        Self::with_pool(pool).await
    }

    /// In-memory database for tests. Pinned to one connection because each
    /// in-memory SQLite connection is its own database.
    pub async fn new_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        Self::with_pool(pool).await
    }

    async fn with_pool(pool: SqlitePool) -> Result<Self> {
        for statement in SCHEMA.split(';') {
            let statement = statement.trim();
            if !statement.is_empty() {
                sqlx::query(statement).execute(&pool).await?;
            }
        }

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self { pool, events })
    }

    fn emit(&self, tenant_id: Option<String>, kind: ChangeKind) {
        // send() fails only when nobody is subscribed.
        let _ = self.events.send(PolicyChange { tenant_id, kind });
    }

    fn decode_tenant(document: &str) -> Result<TenantPolicy> {
        Ok(serde_json::from_str(document)?)
    }

    fn decode_override(document: &str) -> Result<Override> {
        Ok(serde_json::from_str(document)?)
    }
}

#[async_trait]
impl PolicyStore for SqlitePolicyStore {
    async fn get_tenant(&self, tenant_id: &str) -> Result<Option<TenantPolicy>> {
        let row = sqlx::query("SELECT document FROM tenant_policies WHERE tenant_id = ?")
            .bind(tenant_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| Self::decode_tenant(&r.get::<String, _>("document")))
            .transpose()
    }

    async fn upsert_tenant(&self, mut policy: TenantPolicy) -> Result<()> {
        policy.validate()?;
        policy.normalize();

        let existed =
            sqlx::query("SELECT 1 FROM tenant_policies WHERE tenant_id = ?")
                .bind(&policy.tenant_id)
                .fetch_optional(&self.pool)
                .await?
                .is_some();

        let now = now_ms();
        let document = serde_json::to_string(&policy)?;
        sqlx::query(
            r#"
            INSERT INTO tenant_policies (tenant_id, document, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (tenant_id) DO UPDATE SET
                document = excluded.document,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&policy.tenant_id)
        .bind(&document)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.emit(
            Some(policy.tenant_id.clone()),
            if existed {
                ChangeKind::Update
            } else {
                ChangeKind::Insert
            },
        );
        Ok(())
    }

    async fn delete_tenant(&self, tenant_id: &str) -> Result<()> {
        let rows_affected = sqlx::query("DELETE FROM tenant_policies WHERE tenant_id = ?")
            .bind(tenant_id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        if rows_affected == 0 {
            return Err(PolicyError::TenantNotFound(tenant_id.to_string()));
        }

        self.emit(Some(tenant_id.to_string()), ChangeKind::Delete);
        Ok(())
    }

    async fn list_tenants(&self) -> Result<Vec<TenantPolicy>> {
        let rows = sqlx::query("SELECT document FROM tenant_policies ORDER BY tenant_id")
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|r| Self::decode_tenant(&r.get::<String, _>("document")))
            .collect()
    }

    async fn get_global(&self) -> Result<Option<GlobalPolicy>> {
        let row = sqlx::query("SELECT document FROM global_policy WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| Ok(serde_json::from_str(&r.get::<String, _>("document"))?))
            .transpose()
    }

    async fn upsert_global(&self, mut policy: GlobalPolicy) -> Result<()> {
        policy.validate()?;
        policy.normalize();

        let document = serde_json::to_string(&policy)?;
        sqlx::query(
            r#"
            INSERT INTO global_policy (id, document, updated_at)
            VALUES (1, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                document = excluded.document,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&document)
        .bind(now_ms())
        .execute(&self.pool)
        .await?;

        self.emit(None, ChangeKind::Update);
        Ok(())
    }

    async fn create_override(&self, override_doc: Override) -> Result<()> {
        override_doc.validate(now_ms())?;

        let document = serde_json::to_string(&override_doc)?;
        sqlx::query(
            r#"
            INSERT INTO overrides (id, tenant_id, user_id, endpoint, document, expires_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&override_doc.id)
        .bind(&override_doc.tenant_id)
        .bind(&override_doc.user_id)
        .bind(&override_doc.endpoint)
        .bind(&document)
        .bind(override_doc.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete_override(&self, id: &str) -> Result<Override> {
        let row = sqlx::query("SELECT document FROM overrides WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| PolicyError::OverrideNotFound(id.to_string()))?;

        let deleted = Self::decode_override(&row.get::<String, _>("document"))?;

        sqlx::query("DELETE FROM overrides WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(deleted)
    }

    async fn list_overrides(&self, tenant_id: &str) -> Result<Vec<Override>> {
        let rows = sqlx::query(
            "SELECT document FROM overrides WHERE tenant_id = ? AND expires_at > ? ORDER BY expires_at",
        )
        .bind(tenant_id)
        .bind(now_ms())
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| Self::decode_override(&r.get::<String, _>("document")))
            .collect()
    }

    async fn active_overrides(
        &self,
        tenant_id: &str,
        user_id: Option<&str>,
        endpoint: Option<&str>,
    ) -> Result<Vec<Override>> {
        // One query covering all four shapes; precedence is ranked in
        // memory by the caller.
        let rows = sqlx::query(
            r#"
            SELECT document FROM overrides
            WHERE tenant_id = ?
              AND expires_at > ?
              AND (
                    (user_id = ? AND endpoint = ?)
                 OR (user_id = ? AND endpoint IS NULL)
                 OR (user_id IS NULL AND endpoint = ?)
                 OR (user_id IS NULL AND endpoint IS NULL)
              )
            "#,
        )
        .bind(tenant_id)
        .bind(now_ms())
        .bind(user_id)
        .bind(endpoint)
        .bind(user_id)
        .bind(endpoint)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| Self::decode_override(&r.get::<String, _>("document")))
            .collect()
    }

    async fn purge_expired_overrides(&self) -> Result<u64> {
        let purged = sqlx::query("DELETE FROM overrides WHERE expires_at <= ?")
            .bind(now_ms())
            .execute(&self.pool)
            .await?
            .rows_affected();

        if purged > 0 {
            tracing::debug!(purged, "purged expired overrides");
        }
        Ok(purged)
    }

    fn subscribe(&self) -> broadcast::Receiver<PolicyChange> {
        self.events.subscribe()
    }
}
