//! Abuse Detector Background Task
//!
//! Periodically asks the telemetry backend which tenants are being
//! throttled for most of their traffic and installs a time-bounded penalty
//! override on each. The overrides are ordinary documents in the policy
//! store: an operator can inspect and delete them, and every one carries a
//! finite `expires_at`, so the worst a misfiring detector can do is bounded
//! in time.
//!
//! Each run:
//!
//! 1. Query per-tenant `throttled/total` ratios over the trailing window
//! 2. For each tenant above the threshold: skip if *any* active override
//!    already exists for the tenant, otherwise classify severity and create
//!    a penalty override (`adaptive` → penalty multiplier, `fixed` →
//!    custom limit)
//! 3. Emit `gatehouse_abuse_detection_job_runs_total{status}`
//!
//! Runs execute inline in the timer loop, so a slow run cannot overlap the
//! next one; missed ticks are simply dropped. The `abuse_enabled` kill
//! switch prevents the task from being started at all.

use crate::config::{GatehouseConfig, PenaltyType};
use crate::prometheus::{PrometheusClient, TenantThrottleRatio};
use gatehouse_core::{now_ms, Override, OverrideSource, OverrideType};
use gatehouse_observability::metrics as obs;
use gatehouse_policy::{OverrideCache, PolicyStore};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Ratio above which a flagged tenant is classified `high` severity.
const HIGH_SEVERITY_RATIO: f64 = 0.8;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DetectorRunStats {
    pub tenants_examined: usize,
    pub tenants_flagged: usize,
    pub tenants_skipped: usize,
}

/// Periodic job that flags abusive tenants and installs penalty overrides.
pub struct AbuseDetector {
    config: GatehouseConfig,
    prometheus: PrometheusClient,
    store: Arc<dyn PolicyStore>,
    overrides: Arc<OverrideCache>,
}

impl AbuseDetector {
    pub fn new(
        config: GatehouseConfig,
        prometheus: PrometheusClient,
        store: Arc<dyn PolicyStore>,
        overrides: Arc<OverrideCache>,
    ) -> Self {
        Self {
            config,
            prometheus,
            store,
            overrides,
        }
    }

    /// One detection pass over the telemetry backend.
    pub async fn run_once(&self) -> DetectorRunStats {
        let ratios = match self
            .prometheus
            .tenant_throttle_ratios(self.config.abuse_window_minutes)
            .await
        {
            Ok(ratios) => ratios,
            Err(e) => {
                warn!(error = %e, "abuse detection query failed");
                obs::ABUSE_DETECTION_JOB_RUNS_TOTAL
                    .with_label_values(&["error"])
                    .inc();
                return DetectorRunStats::default();
            }
        };

        let mut stats = DetectorRunStats {
            tenants_examined: ratios.len(),
            ..Default::default()
        };

        for TenantThrottleRatio { tenant_id, ratio } in ratios {
            if ratio <= self.config.abuse_throttle_threshold {
                continue;
            }

            // One penalty at a time per tenant, regardless of shape.
            match self.store.list_overrides(&tenant_id).await {
                Ok(active) if !active.is_empty() => {
                    debug!(tenant_id = %tenant_id, "override already active; skipping");
                    stats.tenants_skipped += 1;
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(tenant_id = %tenant_id, error = %e, "override lookup failed; skipping tenant");
                    stats.tenants_skipped += 1;
                    continue;
                }
            }

            let severity = classify_severity(ratio);
            let penalty = self.build_override(&tenant_id, ratio);
            let penalty_type = penalty.override_type;

            match self.store.create_override(penalty).await {
                Ok(()) => {
                    self.overrides.invalidate(&tenant_id, None, None).await;
                    obs::ABUSE_DETECTION_FLAGS_TOTAL
                        .with_label_values(&[&tenant_id, severity])
                        .inc();
                    obs::OVERRIDE_APPLIED_TOTAL
                        .with_label_values(&[penalty_type.as_str(), "auto_detector"])
                        .inc();
                    info!(
                        tenant_id = %tenant_id,
                        ratio = format!("{ratio:.2}"),
                        severity,
                        penalty = penalty_type.as_str(),
                        "abusive tenant penalised"
                    );
                    stats.tenants_flagged += 1;
                }
                Err(e) => {
                    warn!(tenant_id = %tenant_id, error = %e, "failed to create penalty override");
                }
            }
        }

        obs::ABUSE_DETECTION_JOB_RUNS_TOTAL
            .with_label_values(&["ok"])
            .inc();
        stats
    }

    /// The penalty override for one flagged tenant.
    fn build_override(&self, tenant_id: &str, ratio: f64) -> Override {
        let now = now_ms();
        let reason = format!(
            "auto-flagged: {:.0}% of requests throttled over the last {} min",
            ratio * 100.0,
            self.config.abuse_window_minutes
        );

        let (override_type, multiplier, rate, burst) = match self.config.abuse_penalty_type {
            PenaltyType::Adaptive => (
                OverrideType::PenaltyMultiplier,
                Some(self.config.abuse_penalty_multiplier),
                None,
                None,
            ),
            PenaltyType::Fixed => (
                OverrideType::CustomLimit,
                None,
                Some(self.config.abuse_penalty_rate),
                Some(self.config.abuse_penalty_burst),
            ),
        };

        Override {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            user_id: None,
            endpoint: None,
            override_type,
            penalty_multiplier: multiplier,
            custom_rate: rate,
            custom_burst: burst,
            reason,
            source: OverrideSource::AutoDetector,
            created_at: now,
            expires_at: now + self.config.abuse_penalty_duration.as_millis() as i64,
        }
    }

    /// Start the detection loop. Call only when `abuse_enabled` is set.
    pub fn start(self: Arc<Self>, shutdown_rx: oneshot::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            // Spread replicas out so a fleet does not hammer Prometheus in
            // lockstep.
            use rand::Rng;
            let jitter_ms = rand::thread_rng().gen_range(0..5_000);
            tokio::time::sleep(std::time::Duration::from_millis(jitter_ms)).await;

            let mut interval = tokio::time::interval(self.config.abuse_check_interval);
            // Inline runs + skipped ticks → at most one pass in flight.
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut shutdown_rx = shutdown_rx;

            info!(
                interval = ?self.config.abuse_check_interval,
                threshold = self.config.abuse_throttle_threshold,
                "abuse detector started"
            );

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let stats = self.run_once().await;
                        if stats.tenants_flagged > 0 {
                            info!(?stats, "abuse detection pass complete");
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!("abuse detector shutting down");
                        break;
                    }
                }
            }
        })
    }
}

/// Severity classification for a flagged tenant.
pub fn classify_severity(ratio: f64) -> &'static str {
    if ratio > HIGH_SEVERITY_RATIO {
        "high"
    } else {
        "medium"
    }
}
