//! Gatehouse server binary.

use clap::Parser;
use gatehouse_server::{serve, Gatehouse, GatehouseConfig, RateLimitMode};
use tracing_subscriber::EnvFilter;

/// Multi-tenant API rate-limiting service.
#[derive(Debug, Parser)]
#[command(name = "gatehouse-server", version)]
struct Args {
    /// Port to listen on.
    #[arg(long, default_value_t = 8080, env = "GATEHOUSE_PORT")]
    port: u16,

    /// How decisions are applied: shadow | logging | enforcement.
    #[arg(long, default_value = "enforcement", env = "GATEHOUSE_MODE")]
    mode: RateLimitMode,

    /// Redis connection URL for the shared bucket store.
    #[arg(long, default_value = "redis://127.0.0.1/", env = "GATEHOUSE_REDIS_URL")]
    redis_url: String,

    /// Per-call store deadline in milliseconds.
    #[arg(long, default_value_t = 100, env = "GATEHOUSE_STORE_TIMEOUT_MS")]
    store_timeout_ms: u64,

    /// Path of the SQLite policy database.
    #[arg(long, default_value = "gatehouse.db", env = "GATEHOUSE_DATABASE")]
    database: String,

    /// Base URL of the Prometheus query API (enables the abuse detector).
    #[arg(long, env = "GATEHOUSE_PROMETHEUS_URL")]
    prometheus_url: Option<String>,

    /// Shared secret for verified bearer-token decoding.
    #[arg(long, env = "GATEHOUSE_JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    /// Disable the abuse detector.
    #[arg(long, env = "GATEHOUSE_ABUSE_DISABLED")]
    no_abuse_detection: bool,

    /// Fallback limiter budget (requests/minute/tenant) when the store is
    /// unreachable.
    #[arg(long, default_value_t = 60, env = "GATEHOUSE_FALLBACK_RPM")]
    fallback_rpm: u32,
}

impl Args {
    fn into_config(self) -> GatehouseConfig {
        GatehouseConfig {
            mode: self.mode,
            listen_port: self.port,
            redis_url: self.redis_url,
            store_timeout: std::time::Duration::from_millis(self.store_timeout_ms),
            database_path: self.database,
            prometheus_url: self.prometheus_url,
            jwt_secret: self.jwt_secret,
            abuse_enabled: !self.no_abuse_detection,
            fallback_rpm: self.fallback_rpm,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Args::parse().into_config();
    config.validate()?;
    let port = config.listen_port;

    let mut gatehouse = Gatehouse::build(config).await?;
    gatehouse.start();

    let router = gatehouse.router();
    let result = serve(router, port).await;

    gatehouse.stop().await;
    result
}
