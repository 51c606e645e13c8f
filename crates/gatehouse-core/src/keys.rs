//! Bucket Key Templates
//!
//! Bucket state lives in the shared store under one key per `(scope,
//! identity)` pair. All tenant-scoped keys embed a `{tenant:<id>}` hash tag
//! so that every bucket of one tenant lands on the same storage partition
//! and can be evaluated in a single batch. Global keys carry no tag and are
//! routed individually.
//!
//! | Scope | Template |
//! |---|---|
//! | user_global | `{tenant:T}:user:U:bucket` |
//! | user_endpoint | `{tenant:T}:user:U:endpoint:E:bucket` |
//! | tenant_global | `{tenant:T}:bucket` |
//! | tenant_endpoint | `{tenant:T}:endpoint:E:bucket` |
//! | global_endpoint | `global:endpoint:E:bucket` |
//! | global_system | `global:bucket` |
//!
//! `E` is the endpoint mapped through `endpoint_key_component`.

use crate::identity::endpoint_key_component;

pub fn user_global(tenant: &str, user: &str) -> String {
    format!("{{tenant:{tenant}}}:user:{user}:bucket")
}

pub fn user_endpoint(tenant: &str, user: &str, endpoint: &str) -> String {
    format!(
        "{{tenant:{tenant}}}:user:{user}:endpoint:{}:bucket",
        endpoint_key_component(endpoint)
    )
}

pub fn tenant_global(tenant: &str) -> String {
    format!("{{tenant:{tenant}}}:bucket")
}

pub fn tenant_endpoint(tenant: &str, endpoint: &str) -> String {
    format!(
        "{{tenant:{tenant}}}:endpoint:{}:bucket",
        endpoint_key_component(endpoint)
    )
}

pub fn global_endpoint(endpoint: &str) -> String {
    format!("global:endpoint:{}:bucket", endpoint_key_component(endpoint))
}

pub fn global_system() -> String {
    "global:bucket".to_string()
}

/// Keys carrying a `{tenant:...}` hash tag share a storage partition and may
/// be batched together.
pub fn has_tenant_tag(key: &str) -> bool {
    key.starts_with("{tenant:")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_templates_match_contract() {
        assert_eq!(
            user_global("acme", "alice"),
            "{tenant:acme}:user:alice:bucket"
        );
        assert_eq!(
            user_endpoint("acme", "alice", "/api/search"),
            "{tenant:acme}:user:alice:endpoint:/api/search:bucket"
        );
        assert_eq!(tenant_global("acme"), "{tenant:acme}:bucket");
        assert_eq!(
            tenant_endpoint("acme", "/api/upload"),
            "{tenant:acme}:endpoint:/api/upload:bucket"
        );
        assert_eq!(
            global_endpoint("/api/search"),
            "global:endpoint:/api/search:bucket"
        );
        assert_eq!(global_system(), "global:bucket");
    }

    #[test]
    fn endpoint_component_is_sanitised_inside_keys() {
        assert_eq!(
            tenant_endpoint("acme", "/api/items.json"),
            "{tenant:acme}:endpoint:/api/items_json:bucket"
        );
    }

    #[test]
    fn tenant_tag_detection() {
        assert!(has_tenant_tag(&tenant_global("acme")));
        assert!(has_tenant_tag(&user_global("acme", "alice")));
        assert!(!has_tenant_tag(&global_system()));
        assert!(!has_tenant_tag(&global_endpoint("/x")));
    }
}
