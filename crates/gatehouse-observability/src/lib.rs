//! Gatehouse Observability
//!
//! Central Prometheus registry for the rate-limiting service plus the
//! `/metrics` scrape route. Components increment the static series
//! directly; the route renders the registry on demand.

pub mod metrics;

pub use metrics::{create_metrics_router, metrics_handler, render, REGISTRY};
