//! Tenant and global policy handlers.

use super::ApiError;
use crate::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use gatehouse_core::{GlobalPolicy, TenantPolicy};
use serde_json::{json, Value};
use tracing::info;

/// GET /api/v1/tenants: every provisioned tenant policy.
pub async fn list_tenants(
    State(state): State<AppState>,
) -> Result<Json<Vec<TenantPolicy>>, ApiError> {
    Ok(Json(state.store.list_tenants().await?))
}

/// GET /api/v1/tenants/{tenant_id}/policy
pub async fn get_tenant_policy(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<TenantPolicy>, ApiError> {
    state
        .store
        .get_tenant(&tenant_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError(gatehouse_policy::PolicyError::TenantNotFound(tenant_id)))
}

/// PUT /api/v1/tenants/{tenant_id}/policy: create or replace. The path
/// segment is authoritative for the tenant id.
pub async fn put_tenant_policy(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(mut policy): Json<TenantPolicy>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    policy.tenant_id = tenant_id.clone();
    state.store.upsert_tenant(policy).await?;
    state.policies.invalidate_tenant(&tenant_id).await;

    info!(tenant_id = %tenant_id, "tenant policy upserted");
    Ok((StatusCode::OK, Json(json!({"tenant_id": tenant_id}))))
}

/// DELETE /api/v1/tenants/{tenant_id}/policy
pub async fn delete_tenant_policy(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.store.delete_tenant(&tenant_id).await?;
    state.policies.invalidate_tenant(&tenant_id).await;

    info!(tenant_id = %tenant_id, "tenant policy deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/v1/policy/global: 404 until provisioned (the decisioner uses
/// a permissive default in the meantime).
pub async fn get_global_policy(
    State(state): State<AppState>,
) -> Result<axum::response::Response, ApiError> {
    use axum::response::IntoResponse;

    Ok(match state.store.get_global().await? {
        Some(policy) => Json(policy).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "global policy not provisioned", "code": 404})),
        )
            .into_response(),
    })
}

/// PUT /api/v1/policy/global
pub async fn put_global_policy(
    State(state): State<AppState>,
    Json(policy): Json<GlobalPolicy>,
) -> Result<StatusCode, ApiError> {
    state.store.upsert_global(policy).await?;
    state.policies.invalidate_global().await;

    info!("global policy upserted");
    Ok(StatusCode::OK)
}
