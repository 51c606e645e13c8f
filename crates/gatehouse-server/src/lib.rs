//! Gatehouse Server
//!
//! Wires the rate-limiting core into an HTTP service:
//!
//! - the **admin API** for policies and overrides
//! - the **rate-limit middleware** in front of protected routes
//! - the **background jobs**: policy cache refresh, override expiry sweep,
//!   fallback idle sweep, and the abuse detector
//! - the `/metrics` exporter and `/health`
//!
//! The [`Gatehouse`] application object owns every component and its
//! lifecycle: construct it once at startup, `start()` the background tasks,
//! serve the router, and `stop()` on shutdown to drain the tasks. Nothing
//! here is a process-wide singleton, so tests run many instances side by
//! side.

pub mod config;
pub mod detector;
pub mod handlers;
pub mod identity;
pub mod middleware;
pub mod prometheus;

pub use config::{GatehouseConfig, PenaltyType, RateLimitMode};
pub use detector::AbuseDetector;
pub use identity::IdentityExtractor;
pub use middleware::RateLimitLayer;
pub use prometheus::PrometheusClient;

use axum::{routing::get, Json, Router};
use gatehouse_limiter::{
    BucketBackend, CircuitBreaker, CircuitBreakerConfig, Decisioner, DecisionerConfig,
    FallbackConfig, FallbackLimiter, RedisBucketEngine,
};
use gatehouse_policy::{
    OverrideCache, OverrideCacheConfig, PolicyCache, PolicyCacheConfig, PolicyStore,
    SqlitePolicyStore,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn PolicyStore>,
    pub policies: Arc<PolicyCache>,
    pub overrides: Arc<OverrideCache>,
    pub decisioner: Arc<Decisioner>,
}

struct RunningTask {
    name: &'static str,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// The assembled service: components plus background-task lifecycle.
pub struct Gatehouse {
    config: GatehouseConfig,
    state: AppState,
    fallback: Arc<FallbackLimiter>,
    detector: Option<Arc<AbuseDetector>>,
    tasks: Vec<RunningTask>,
}

impl Gatehouse {
    /// Connect to the real backends (Redis bucket store, SQLite policy
    /// database) and assemble the service.
    pub async fn build(config: GatehouseConfig) -> Result<Self, Box<dyn std::error::Error>> {
        config.validate()?;

        let store: Arc<dyn PolicyStore> =
            Arc::new(SqlitePolicyStore::new(&config.database_path).await?);
        let backend: Arc<dyn BucketBackend> = Arc::new(
            RedisBucketEngine::connect(&config.redis_url, config.store_timeout).await?,
        );

        Ok(Self::with_components(config, store, backend))
    }

    /// Assemble the service from injected backends. Used by `build` and by
    /// tests that substitute the in-memory bucket backend.
    pub fn with_components(
        config: GatehouseConfig,
        store: Arc<dyn PolicyStore>,
        backend: Arc<dyn BucketBackend>,
    ) -> Self {
        gatehouse_observability::metrics::init();

        let policies = Arc::new(PolicyCache::new(
            store.clone(),
            PolicyCacheConfig {
                ttl_ms: config.policy_cache_ttl_ms,
                max_size: config.policy_cache_max_size,
                refresh_interval: config.policy_cache_refresh_interval,
            },
        ));
        let overrides = Arc::new(OverrideCache::new(
            store.clone(),
            OverrideCacheConfig {
                ttl_ms: config.override_cache_ttl_ms,
                max_size: config.override_cache_max_size,
            },
        ));
        let breaker = Arc::new(CircuitBreaker::new(
            "redis",
            CircuitBreakerConfig {
                failure_threshold: config.circuit_failure_threshold,
                timeout: config.circuit_timeout,
                success_threshold: config.circuit_success_threshold,
            },
        ));
        let fallback = Arc::new(FallbackLimiter::new(FallbackConfig {
            rpm: config.fallback_rpm,
            ..Default::default()
        }));
        let decisioner = Arc::new(Decisioner::new(
            policies.clone(),
            overrides.clone(),
            backend,
            breaker,
            fallback.clone(),
            DecisionerConfig {
                bucket_ttl: config.bucket_ttl,
                ..Default::default()
            },
        ));

        let detector = match (&config.prometheus_url, config.abuse_enabled) {
            (Some(url), true) => Some(Arc::new(AbuseDetector::new(
                config.clone(),
                PrometheusClient::new(url),
                store.clone(),
                overrides.clone(),
            ))),
            (None, true) => {
                warn!("abuse detection enabled but no prometheus_url configured; detector inert");
                None
            }
            _ => None,
        };

        let state = AppState {
            store,
            policies,
            overrides,
            decisioner,
        };

        Self {
            config,
            state,
            fallback,
            detector,
            tasks: Vec::new(),
        }
    }

    pub fn state(&self) -> AppState {
        self.state.clone()
    }

    pub fn config(&self) -> &GatehouseConfig {
        &self.config
    }

    /// The full router: admin API, protected demo route, health, metrics.
    pub fn router(&self) -> Router {
        let layer = RateLimitLayer::new(
            self.state.decisioner.clone(),
            IdentityExtractor::new(self.config.jwt_secret.clone()),
            self.config.mode,
        );
        create_router(self.state(), layer)
    }

    /// Start every background task. Idempotent only in the sense that it
    /// should be called once; a second call would double the workers.
    pub fn start(&mut self) {
        let (tx, rx) = oneshot::channel();
        self.tasks.push(RunningTask {
            name: "policy-cache",
            shutdown: tx,
            handle: self.state.policies.clone().start(rx),
        });

        let (tx, rx) = oneshot::channel();
        self.tasks.push(RunningTask {
            name: "fallback-sweep",
            shutdown: tx,
            handle: self.fallback.clone().start(rx),
        });

        let (tx, rx) = oneshot::channel();
        self.tasks.push(RunningTask {
            name: "override-sweep",
            shutdown: tx,
            handle: spawn_override_sweeper(
                self.state.store.clone(),
                self.config.override_sweep_interval,
                rx,
            ),
        });

        if let Some(detector) = &self.detector {
            let (tx, rx) = oneshot::channel();
            self.tasks.push(RunningTask {
                name: "abuse-detector",
                shutdown: tx,
                handle: detector.clone().start(rx),
            });
        }

        info!(tasks = self.tasks.len(), "background tasks started");
    }

    /// Signal every background task and wait for it to drain.
    pub async fn stop(mut self) {
        for task in self.tasks.drain(..) {
            let _ = task.shutdown.send(());
            if task.handle.await.is_err() {
                warn!(task = task.name, "background task panicked during shutdown");
            }
        }
        info!("gatehouse stopped");
    }
}

/// Create the API router with all endpoints
pub fn create_router(state: AppState, rate_limit: RateLimitLayer) -> Router {
    let admin = Router::new()
        .route("/tenants", get(handlers::policies::list_tenants))
        .route(
            "/tenants/:tenant_id/policy",
            get(handlers::policies::get_tenant_policy)
                .put(handlers::policies::put_tenant_policy)
                .delete(handlers::policies::delete_tenant_policy),
        )
        .route(
            "/policy/global",
            get(handlers::policies::get_global_policy).put(handlers::policies::put_global_policy),
        )
        .route(
            "/tenants/:tenant_id/overrides",
            get(handlers::overrides::list_overrides).post(handlers::overrides::create_override),
        )
        .route(
            "/overrides/:id",
            axum::routing::delete(handlers::overrides::delete_override),
        )
        .with_state(state.clone());

    // Demo route exercising the full decision pipeline.
    let protected = Router::new()
        .route("/echo", get(echo))
        .route("/echo/*rest", get(echo))
        .layer(rate_limit);

    Router::new()
        .nest("/api/v1", admin.merge(protected))
        .route("/health", get(handlers::health_check))
        .merge(gatehouse_observability::create_metrics_router())
        .layer(CorsLayer::permissive())
}

async fn echo(uri: axum::http::Uri) -> Json<serde_json::Value> {
    Json(json!({"message": "ok", "path": uri.path()}))
}

/// Start the API server
pub async fn serve(router: Router, port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("0.0.0.0:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("gatehouse listening on {}", addr);
    info!("   Health:  http://localhost:{}/health", port);
    info!("   Metrics: http://localhost:{}/metrics", port);

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    })
    .await?;
    Ok(())
}

/// Periodically delete expired overrides, standing in for a native TTL
/// index on `expires_at`.
fn spawn_override_sweeper(
    store: Arc<dyn PolicyStore>,
    interval: Duration,
    shutdown_rx: oneshot::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut shutdown_rx = shutdown_rx;

        info!(interval = ?interval, "override sweep started");
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = store.purge_expired_overrides().await {
                        warn!(error = %e, "override purge failed");
                    }
                }
                _ = &mut shutdown_rx => {
                    info!("override sweep shutting down");
                    break;
                }
            }
        }
    })
}
