//! Override management handlers.

use super::ApiError;
use crate::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use gatehouse_core::{now_ms, Override, OverrideSource, OverrideType};
use serde::Deserialize;
use tracing::info;

/// Body of POST /api/v1/tenants/{tenant_id}/overrides.
#[derive(Debug, Deserialize)]
pub struct CreateOverrideRequest {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    pub override_type: OverrideType,
    #[serde(default)]
    pub penalty_multiplier: Option<f64>,
    #[serde(default)]
    pub custom_rate: Option<u32>,
    #[serde(default)]
    pub custom_burst: Option<u32>,
    pub reason: String,
    /// Lifetime of the override from now, in milliseconds.
    pub duration_ms: i64,
}

/// GET /api/v1/tenants/{tenant_id}/overrides: active overrides only.
pub async fn list_overrides(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Result<Json<Vec<Override>>, ApiError> {
    Ok(Json(state.store.list_overrides(&tenant_id).await?))
}

/// POST /api/v1/tenants/{tenant_id}/overrides
pub async fn create_override(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Json(request): Json<CreateOverrideRequest>,
) -> Result<(StatusCode, Json<Override>), ApiError> {
    let now = now_ms();
    let override_doc = Override {
        id: uuid::Uuid::new_v4().to_string(),
        tenant_id: tenant_id.clone(),
        user_id: request.user_id,
        endpoint: request.endpoint,
        override_type: request.override_type,
        penalty_multiplier: request.penalty_multiplier,
        custom_rate: request.custom_rate,
        custom_burst: request.custom_burst,
        reason: request.reason,
        source: OverrideSource::ManualOperator,
        created_at: now,
        expires_at: now + request.duration_ms,
    };

    state.store.create_override(override_doc.clone()).await?;
    state
        .overrides
        .invalidate(
            &tenant_id,
            override_doc.user_id.as_deref(),
            override_doc.endpoint.as_deref(),
        )
        .await;

    info!(
        tenant_id = %tenant_id,
        override_id = %override_doc.id,
        override_type = override_doc.override_type.as_str(),
        "override created"
    );
    Ok((StatusCode::CREATED, Json(override_doc)))
}

/// DELETE /api/v1/overrides/{id}
pub async fn delete_override(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let deleted = state.store.delete_override(&id).await?;
    state
        .overrides
        .invalidate(
            &deleted.tenant_id,
            deleted.user_id.as_deref(),
            deleted.endpoint.as_deref(),
        )
        .await;

    info!(override_id = %id, tenant_id = %deleted.tenant_id, "override deleted");
    Ok(StatusCode::NO_CONTENT)
}
