//! Rate-Limit Middleware
//!
//! Tower layer that runs the decision pipeline in front of a protected
//! router and translates the [`Decision`] into response behaviour.
//!
//! ## Shared behaviour (every mode)
//!
//! `X-RateLimit-Limit`, `X-RateLimit-Remaining`, `X-RateLimit-Reset` and
//! `X-RateLimit-Mode` are always set from the decision. A soft-allowed
//! decision adds `X-RateLimit-Warning`.
//!
//! ## Mode matrix for a hard deny
//!
//! | Mode | Response | Extra header |
//! |---|---|---|
//! | shadow | pass through | `X-RateLimit-Shadow: true` |
//! | logging | pass through | `X-RateLimit-Exceeded: true` |
//! | enforcement | 429 + JSON body | `Retry-After` |
//!
//! ## Fail-open guarantee
//!
//! A decisioner error never blocks traffic and never produces a 5xx: the
//! request passes with `X-RateLimit-Error: true`. Only caller cancellation
//! abandons a request, counted in `gatehouse_requests_cancelled_total`.

use crate::config::RateLimitMode;
use crate::identity::IdentityExtractor;
use axum::{
    body::Body,
    extract::{ConnectInfo, OriginalUri, Request},
    http::{header::HeaderName, HeaderValue, StatusCode},
    response::Response,
};
use futures::future::BoxFuture;
use gatehouse_core::{Decision, ThrottleState};
use gatehouse_limiter::Decisioner;
use gatehouse_observability::metrics as obs;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::warn;

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";
pub const HEADER_RESET: &str = "x-ratelimit-reset";
pub const HEADER_MODE: &str = "x-ratelimit-mode";
pub const HEADER_WARNING: &str = "x-ratelimit-warning";
pub const HEADER_SHADOW: &str = "x-ratelimit-shadow";
pub const HEADER_EXCEEDED: &str = "x-ratelimit-exceeded";
pub const HEADER_ERROR: &str = "x-ratelimit-error";

/// Layer wiring the decisioner and mode into a router.
#[derive(Clone)]
pub struct RateLimitLayer {
    decisioner: Arc<Decisioner>,
    extractor: IdentityExtractor,
    mode: RateLimitMode,
}

impl RateLimitLayer {
    pub fn new(
        decisioner: Arc<Decisioner>,
        extractor: IdentityExtractor,
        mode: RateLimitMode,
    ) -> Self {
        Self {
            decisioner,
            extractor,
            mode,
        }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitMiddleware {
            inner,
            decisioner: self.decisioner.clone(),
            extractor: self.extractor.clone(),
            mode: self.mode,
        }
    }
}

#[derive(Clone)]
pub struct RateLimitMiddleware<S> {
    inner: S,
    decisioner: Arc<Decisioner>,
    extractor: IdentityExtractor,
    mode: RateLimitMode,
}

impl<S> Service<Request> for RateLimitMiddleware<S>
where
    S: Service<Request, Response = Response> + Send + Clone + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let decisioner = self.decisioner.clone();
        let extractor = self.extractor.clone();
        let mode = self.mode;
        let mut inner = self.inner.clone();

        Box::pin(async move {
            // Nested routers see a prefix-stripped URI; the identity must
            // be keyed on the path the client actually requested.
            let path = request
                .extensions()
                .get::<OriginalUri>()
                .map(|uri| uri.path().to_string())
                .unwrap_or_else(|| request.uri().path().to_string());
            let ip = client_ip(&request);
            let identity = extractor.extract(request.headers(), &path, ip.as_deref());

            let Some(identity) = identity else {
                // No usable identity: skip the check entirely.
                return inner.call(request).await;
            };

            let guard = CancellationGuard::armed();
            let decision = decisioner.decide(&identity).await;
            guard.disarm();

            let decision = match decision {
                Ok(decision) => decision,
                Err(e) => {
                    warn!(
                        tenant_id = %identity.tenant_id,
                        endpoint = %identity.endpoint,
                        error = %e,
                        "rate-limit decision failed; failing open"
                    );
                    let mut response = inner.call(request).await?;
                    set_header(&mut response, HEADER_ERROR, "true");
                    return Ok(response);
                }
            };

            record_request(&identity.tenant_id, &identity.endpoint, &decision, mode);

            if !decision.allowed && mode == RateLimitMode::Enforcement {
                return Ok(throttled_response(&decision, mode));
            }

            let mut response = inner.call(request).await?;
            apply_headers(&mut response, &decision, mode);
            match mode {
                RateLimitMode::Shadow if !decision.allowed => {
                    set_header(&mut response, HEADER_SHADOW, "true");
                }
                RateLimitMode::Logging if !decision.allowed => {
                    set_header(&mut response, HEADER_EXCEEDED, "true");
                }
                _ => {}
            }
            Ok(response)
        })
    }
}

/// Counts a dropped decision future as a cancellation.
struct CancellationGuard {
    armed: bool,
}

impl CancellationGuard {
    fn armed() -> Self {
        Self { armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancellationGuard {
    fn drop(&mut self) {
        if self.armed {
            obs::REQUESTS_CANCELLED_TOTAL.inc();
        }
    }
}

fn client_ip(request: &Request) -> Option<String> {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return Some(first.to_string());
            }
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
}

fn record_request(tenant_id: &str, endpoint: &str, decision: &Decision, mode: RateLimitMode) {
    let result = if !decision.allowed {
        "throttled_hard"
    } else if decision.state == ThrottleState::Soft {
        "throttled_soft"
    } else {
        "allowed"
    };
    obs::REQUESTS_TOTAL
        .with_label_values(&[
            tenant_id,
            endpoint,
            result,
            decision.state.as_str(),
            mode.as_str(),
        ])
        .inc();
}

fn apply_headers(response: &mut Response, decision: &Decision, mode: RateLimitMode) {
    set_header(response, HEADER_LIMIT, &decision.limit.to_string());
    set_header(response, HEADER_REMAINING, &decision.remaining.to_string());
    set_header(response, HEADER_RESET, &decision.reset_epoch_s.to_string());
    set_header(response, HEADER_MODE, mode.as_str());
    if decision.allowed && decision.state == ThrottleState::Soft {
        set_header(response, HEADER_WARNING, "true");
    }
}

fn throttled_response(decision: &Decision, mode: RateLimitMode) -> Response {
    let retry_after = decision.retry_after_s.unwrap_or(0);
    let body = json!({
        "error": "Too Many Requests",
        "message": format!("Rate limit exceeded for {}", decision.scope.as_str()),
        "limit": decision.limit,
        "remaining": decision.remaining,
        "reset": decision.reset_epoch_s,
        "retry_after": retry_after,
        "scope": decision.scope.as_str(),
    });

    let mut response = Response::builder()
        .status(StatusCode::TOO_MANY_REQUESTS)
        .header("content-type", "application/json")
        .header("retry-after", retry_after.to_string())
        .body(Body::from(body.to_string()))
        .expect("static response builds");
    apply_headers(&mut response, decision, mode);
    response
}

fn set_header(response: &mut Response, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        response.headers_mut().insert(name, value);
    }
}
