//! Gatehouse Limiter
//!
//! The decision pipeline of the rate-limiting service: atomic token-bucket
//! evaluation against the shared store, hierarchical decisioning over up to
//! six scopes, and the resilience layer that keeps decisions flowing when
//! the store does not.
//!
//! ## Pieces
//!
//! - [`script`]: the server-side atomic bucket primitive (Lua) and the
//!   reset/retry math derived from its results
//! - [`engine`]: the [`BucketBackend`] trait and the Redis implementation
//!   with script caching and hash-tag-aware batch dispatch
//! - [`memory`]: an in-process backend with identical semantics, for tests
//!   and single-node deployments
//! - [`circuit_breaker`]: closed/open/half-open state machine around the
//!   store
//! - [`fallback`]: process-local sliding-window limiter used while the
//!   store is unreachable
//! - [`decisioner`]: the orchestrator tying policy resolution, overrides,
//!   dispatch and aggregation together
//!
//! ## Request flow
//!
//! ```text
//! RequestIdentity
//!       │
//!       ▼
//! ┌────────────┐   policy + override    ┌──────────────────┐
//! │ Decisioner │ ─────────────────────→ │ Policy/Override  │
//! │            │ ←───────────────────── │     caches       │
//! │            │                        └──────────────────┘
//! │            │   batch + singles      ┌──────────────────┐
//! │            │ ─────────────────────→ │  BucketBackend   │──→ Redis
//! │            │ ←──── verdicts ─────── │ (circuit-gated)  │
//! └─────┬──────┘                        └────────┬─────────┘
//!       │ aggregate                              │ on failure
//!       ▼                                        ▼
//!   Decision ←─────────────────────────── FallbackLimiter
//! ```

pub mod circuit_breaker;
pub mod decisioner;
pub mod engine;
pub mod error;
pub mod fallback;
pub mod memory;
pub mod script;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use decisioner::{Decisioner, DecisionerConfig};
pub use engine::{BucketBackend, RedisBucketEngine};
pub use error::{LimiterError, Result};
pub use fallback::{FallbackConfig, FallbackLimiter};
pub use memory::MemoryBucketBackend;
pub use script::{BucketParams, BucketVerdict};
