//! Fallback Limiter
//!
//! When the shared store is unreachable (timeout, connection failure, or
//! the circuit breaker is open), liveness beats precision: requests still
//! get a decision from this process-local, per-tenant sliding-window
//! limiter. The window counts allowed requests over the last 60 seconds
//! against a configured `fallback_rpm`; thresholds are fixed at soft=100%,
//! hard=110% of that rate.
//!
//! The trade-offs are deliberate: counts are per-process (a fleet of N
//! workers admits up to N x fallback_rpm) and per-tenant only: users
//! within a tenant share the window. A periodic sweep evicts tenants idle
//! for more than twice the window so the map stays bounded.

use gatehouse_core::{now_ms, Decision, Scope, ThrottleState};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};

const FALLBACK_SOFT_PCT: f64 = 100.0;
const FALLBACK_HARD_PCT: f64 = 110.0;

#[derive(Debug, Clone)]
pub struct FallbackConfig {
    /// Requests per tenant admitted per window.
    pub rpm: u32,
    /// Window length. 60 s unless a test shrinks it.
    pub window: Duration,
    /// How often idle tenants are swept out.
    pub sweep_interval: Duration,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            rpm: 60,
            window: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(300),
        }
    }
}

struct WindowState {
    /// Timestamps (ms) of admitted requests, oldest first.
    admitted: VecDeque<i64>,
    last_activity_ms: i64,
}

/// Process-local sliding-window limiter used when the primary path fails.
pub struct FallbackLimiter {
    config: FallbackConfig,
    tenants: RwLock<HashMap<String, WindowState>>,
}

impl FallbackLimiter {
    pub fn new(config: FallbackConfig) -> Self {
        Self {
            config,
            tenants: RwLock::new(HashMap::new()),
        }
    }

    /// Produce a degraded decision for one tenant. Labelled `tenant_global`
    /// so dashboards can tell fallback decisions from primary ones by the
    /// fallback activation counter alone.
    pub async fn check(&self, tenant_id: &str) -> Decision {
        let now = now_ms();
        let window_ms = self.config.window.as_millis() as i64;
        let rpm = self.config.rpm;

        let mut tenants = self.tenants.write().await;
        let state = tenants.entry(tenant_id.to_string()).or_insert_with(|| WindowState {
            admitted: VecDeque::new(),
            last_activity_ms: now,
        });
        state.last_activity_ms = now;

        while let Some(&oldest) = state.admitted.front() {
            if now - oldest >= window_ms {
                state.admitted.pop_front();
            } else {
                break;
            }
        }

        let count = state.admitted.len() as u32;
        let allowed = count < rpm;

        let mut retry_after_s = None;
        if allowed {
            state.admitted.push_back(now);
        } else if let Some(&oldest) = state.admitted.front() {
            let age = now - oldest;
            retry_after_s = Some(((window_ms - age).max(0) as u64).div_ceil(1000));
        }

        let effective = if allowed { count + 1 } else { count };
        let usage_pct = effective as f64 / rpm as f64 * 100.0;
        let state_label = if usage_pct >= FALLBACK_HARD_PCT {
            ThrottleState::Hard
        } else if usage_pct >= FALLBACK_SOFT_PCT {
            ThrottleState::Soft
        } else {
            ThrottleState::Normal
        };

        Decision {
            allowed,
            state: state_label,
            scope: Scope::TenantGlobal,
            limit: rpm,
            remaining: rpm.saturating_sub(effective) as u64,
            reset_epoch_s: ((now + window_ms) as u64).div_ceil(1000) as i64,
            retry_after_s,
            checks: Vec::new(),
        }
    }

    /// Evict tenants idle for more than twice the window.
    pub async fn sweep(&self) {
        let cutoff = now_ms() - 2 * self.config.window.as_millis() as i64;
        let mut tenants = self.tenants.write().await;
        let before = tenants.len();
        tenants.retain(|_, state| state.last_activity_ms > cutoff);
        let evicted = before - tenants.len();
        if evicted > 0 {
            debug!(evicted, "fallback limiter swept idle tenants");
        }
    }

    pub async fn tracked_tenants(&self) -> usize {
        self.tenants.read().await.len()
    }

    /// Start the periodic sweep task.
    pub fn start(self: Arc<Self>, shutdown_rx: oneshot::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut shutdown_rx = shutdown_rx;

            info!(interval = ?self.config.sweep_interval, "fallback sweep started");
            loop {
                tokio::select! {
                    _ = interval.tick() => self.sweep().await,
                    _ = &mut shutdown_rx => {
                        info!("fallback sweep shutting down");
                        break;
                    }
                }
            }
        })
    }
}
