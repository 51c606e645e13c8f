//! Admin API Handlers
//!
//! HTTP/JSON surface for operating the service: tenant and global policy
//! CRUD, override management, and health. Every mutation goes through the
//! policy store and then invalidates the affected cache entries, so the
//! hot path converges immediately instead of waiting out a TTL.

pub mod overrides;
pub mod policies;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use gatehouse_policy::PolicyError;
use serde::Serialize;
use serde_json::json;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Maps policy-store errors onto HTTP statuses: validation → 400,
/// not-found → 404, infrastructure → 500.
pub struct ApiError(pub PolicyError);

impl From<PolicyError> for ApiError {
    fn from(e: PolicyError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            PolicyError::InvalidPolicy(_) | PolicyError::InvalidOverride(_) => {
                StatusCode::BAD_REQUEST
            }
            PolicyError::TenantNotFound(_) | PolicyError::OverrideNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            PolicyError::Database(_) | PolicyError::Serialization(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = json!({
            "error": self.0.to_string(),
            "code": status.as_u16(),
        });
        (status, Json(body)).into_response()
    }
}
