//! Gatehouse Core Types
//!
//! This crate defines the domain model shared by every Gatehouse component:
//! policies, overrides, request identities, scopes and decisions, plus the
//! bucket-key templates that tie them to the shared store.
//!
//! ## The model in one paragraph
//!
//! A tenant has a `TenantPolicy`: token-bucket limits for the tenant as a
//! whole, optionally for each of its users, and optionally per endpoint for
//! either. A singleton `GlobalPolicy` protects the system behind all tenants.
//! An `Override` temporarily bends a tenant's effective policy (penalty
//! multiplier, custom limit, or outright ban). Each request resolves to a
//! `RequestIdentity`, is checked against up to six bucket scopes, and yields
//! a `Decision` that the HTTP middleware translates into headers and status
//! codes.
//!
//! ## Design decisions
//!
//! - All types are Serialize/Deserialize for storage and API responses
//! - Timestamps are i64 (milliseconds since epoch)
//! - Rates are f64 so sub-1/s refill rates survive the rpm/60 derivation
//! - Endpoint maps are plain `HashMap<String, BucketPolicy>` regardless of
//!   how the backing store shaped them

pub mod decision;
pub mod identity;
pub mod keys;
pub mod overrides;
pub mod policy;

pub use decision::{CheckOutcome, Decision, Scope, ThrottleState};
pub use identity::{normalize_path, sanitize_ip, RequestIdentity, ANONYMOUS_TENANT, DEFAULT_USER};
pub use overrides::{select_active, Override, OverrideSource, OverrideType};
pub use policy::{BucketPolicy, GlobalPolicy, PolicyValidationError, TenantPolicy, ThrottleConfig};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
