use axum::http::{header::CONTENT_TYPE, StatusCode};
use axum::response::IntoResponse;
use axum::{routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    Encoder, Gauge, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    /// Global Prometheus metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // Request Metrics
    // ============================================================================

    /// Rate-limit decisions, labelled with the outcome.
    /// result is one of: allowed, throttled_soft, throttled_hard.
    pub static ref REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("gatehouse_requests_total", "Total rate-limit decisions"),
        &["tenant_id", "endpoint", "result", "state", "mode"]
    ).expect("metric can be created");

    /// Latency of one bucket check, per scope.
    pub static ref CHECK_DURATION_MS: HistogramVec = HistogramVec::new(
        HistogramOpts::new("gatehouse_check_duration_ms", "Bucket check duration in milliseconds")
            .buckets(vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0]),
        &["scope"]
    ).expect("metric can be created");

    /// Requests abandoned by the caller before a decision was produced.
    pub static ref REQUESTS_CANCELLED_TOTAL: IntCounter = IntCounter::new(
        "gatehouse_requests_cancelled_total",
        "Requests cancelled before a rate-limit decision"
    ).expect("metric can be created");

    // ============================================================================
    // Bucket Metrics
    // ============================================================================

    /// Tokens remaining in the deciding bucket.
    pub static ref BUCKET_TOKENS: IntGaugeVec = IntGaugeVec::new(
        Opts::new("gatehouse_bucket_tokens", "Tokens remaining per bucket scope"),
        &["scope", "tenant_id"]
    ).expect("metric can be created");

    /// Usage percentage of the deciding bucket.
    pub static ref BUCKET_USAGE_PCT: IntGaugeVec = IntGaugeVec::new(
        Opts::new("gatehouse_bucket_usage_pct", "Bucket usage percentage"),
        &["scope", "tenant_id", "endpoint"]
    ).expect("metric can be created");

    // ============================================================================
    // Policy Cache Metrics
    // ============================================================================

    pub static ref POLICY_CACHE_HITS_TOTAL: IntCounter = IntCounter::new(
        "gatehouse_policy_cache_hits_total",
        "Tenant policy cache hits"
    ).expect("metric can be created");

    pub static ref POLICY_CACHE_MISSES_TOTAL: IntCounter = IntCounter::new(
        "gatehouse_policy_cache_misses_total",
        "Tenant policy cache misses"
    ).expect("metric can be created");

    pub static ref POLICY_CACHE_HIT_RATIO: Gauge = Gauge::new(
        "gatehouse_policy_cache_hit_ratio",
        "Tenant policy cache hit ratio (0.0 - 1.0)"
    ).expect("metric can be created");

    // ============================================================================
    // Resilience Metrics
    // ============================================================================

    /// Fallback limiter activations by trigger.
    /// reason is one of: circuit_open, store_timeout, store_unavailable.
    pub static ref FALLBACK_ACTIVATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("gatehouse_fallback_activations_total", "Local fallback limiter activations"),
        &["reason"]
    ).expect("metric can be created");

    /// Circuit breaker state: 0=closed, 1=half-open, 2=open.
    pub static ref CIRCUIT_BREAKER_STATE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("gatehouse_circuit_breaker_state", "Circuit breaker state (0=closed, 1=half-open, 2=open)"),
        &["resource"]
    ).expect("metric can be created");

    pub static ref CIRCUIT_BREAKER_TRANSITIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("gatehouse_circuit_breaker_transitions_total", "Circuit breaker state transitions"),
        &["resource", "from", "to"]
    ).expect("metric can be created");

    // ============================================================================
    // Override / Abuse Metrics
    // ============================================================================

    pub static ref OVERRIDE_APPLIED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("gatehouse_override_applied_total", "Overrides applied to decisions"),
        &["type", "source"]
    ).expect("metric can be created");

    pub static ref ABUSE_DETECTION_FLAGS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("gatehouse_abuse_detection_flags_total", "Tenants flagged by the abuse detector"),
        &["tenant_id", "severity"]
    ).expect("metric can be created");

    /// status is one of: ok, error, skipped.
    pub static ref ABUSE_DETECTION_JOB_RUNS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("gatehouse_abuse_detection_job_runs_total", "Abuse detector job executions"),
        &["status"]
    ).expect("metric can be created");
}

/// Register every series with the global registry.
/// Can be called multiple times safely (idempotent).
pub fn init() {
    INIT.call_once(|| {
        REGISTRY
            .register(Box::new(REQUESTS_TOTAL.clone()))
            .expect("requests_total can be registered");
        REGISTRY
            .register(Box::new(CHECK_DURATION_MS.clone()))
            .expect("check_duration_ms can be registered");
        REGISTRY
            .register(Box::new(REQUESTS_CANCELLED_TOTAL.clone()))
            .expect("requests_cancelled_total can be registered");
        REGISTRY
            .register(Box::new(BUCKET_TOKENS.clone()))
            .expect("bucket_tokens can be registered");
        REGISTRY
            .register(Box::new(BUCKET_USAGE_PCT.clone()))
            .expect("bucket_usage_pct can be registered");
        REGISTRY
            .register(Box::new(POLICY_CACHE_HITS_TOTAL.clone()))
            .expect("policy_cache_hits_total can be registered");
        REGISTRY
            .register(Box::new(POLICY_CACHE_MISSES_TOTAL.clone()))
            .expect("policy_cache_misses_total can be registered");
        REGISTRY
            .register(Box::new(POLICY_CACHE_HIT_RATIO.clone()))
            .expect("policy_cache_hit_ratio can be registered");
        REGISTRY
            .register(Box::new(FALLBACK_ACTIVATIONS_TOTAL.clone()))
            .expect("fallback_activations_total can be registered");
        REGISTRY
            .register(Box::new(CIRCUIT_BREAKER_STATE.clone()))
            .expect("circuit_breaker_state can be registered");
        REGISTRY
            .register(Box::new(CIRCUIT_BREAKER_TRANSITIONS_TOTAL.clone()))
            .expect("circuit_breaker_transitions_total can be registered");
        REGISTRY
            .register(Box::new(OVERRIDE_APPLIED_TOTAL.clone()))
            .expect("override_applied_total can be registered");
        REGISTRY
            .register(Box::new(ABUSE_DETECTION_FLAGS_TOTAL.clone()))
            .expect("abuse_detection_flags_total can be registered");
        REGISTRY
            .register(Box::new(ABUSE_DETECTION_JOB_RUNS_TOTAL.clone()))
            .expect("abuse_detection_job_runs_total can be registered");
    });
}

// ============================================================================
// Exporter
// ============================================================================

/// Render every registered `gatehouse_*` series in the Prometheus text
/// exposition format.
pub fn render() -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

/// Handler serving the scrape endpoint. Rendering only fails on a
/// malformed registry, which would be a bug here, not in the scraper, so
/// it surfaces as a 500 with the reason in the body.
pub async fn metrics_handler() -> axum::response::Response {
    match render() {
        Ok(body) => (
            StatusCode::OK,
            [(CONTENT_TYPE, TextEncoder::new().format_type().to_string())],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "metric encoding failed");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Router exposing `/metrics`, merged into the server's main router.
/// Registers the series first so a scrape that races startup still sees
/// the full (zeroed) contract.
pub fn create_metrics_router() -> Router {
    init();
    Router::new().route("/metrics", get(metrics_handler))
}
