//! Request Identity
//!
//! Every request resolves to a `(tenant_id, user_id, endpoint, ip)` tuple
//! before any bucket is consulted. The HTTP layer owns the ordered lookup
//! across auth sources; this module owns the resulting type and the path
//! normalisation rules that feed bucket-key generation.

use serde::{Deserialize, Serialize};

/// Tenant id used when no authentication material is present.
pub const ANONYMOUS_TENANT: &str = "anonymous";

/// User id used when the caller identified a tenant but no user.
pub const DEFAULT_USER: &str = "default";

/// The identity a request is limited under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestIdentity {
    pub tenant_id: String,
    pub user_id: String,

    /// Request path without query string, trailing slash trimmed.
    pub endpoint: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
}

impl RequestIdentity {
    pub fn new(
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            endpoint: endpoint.into(),
            ip_address: None,
        }
    }

    /// Identity for an unauthenticated caller, keyed by source address.
    pub fn anonymous(ip: &str, endpoint: impl Into<String>) -> Self {
        Self {
            tenant_id: ANONYMOUS_TENANT.to_string(),
            user_id: format!("ip_{}", sanitize_ip(ip)),
            endpoint: endpoint.into(),
            ip_address: Some(ip.to_string()),
        }
    }
}

/// Normalise a request path for policy lookup: drop the query string and any
/// trailing slash (the root path stays `/`).
pub fn normalize_path(path: &str) -> String {
    let path = path.split('?').next().unwrap_or(path);
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Map an endpoint into the restricted alphabet used inside bucket keys:
/// anything outside `[A-Za-z0-9/_-]` becomes `_`.
pub fn endpoint_key_component(endpoint: &str) -> String {
    endpoint
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '/' || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Sanitise an IP address for use inside a user id (dots and colons become
/// underscores).
pub fn sanitize_ip(ip: &str) -> String {
    ip.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}
