//! Decisioner
//!
//! The hot path of the service. For one `RequestIdentity` it:
//!
//! 1. Resolves the tenant policy (cache-first; no policy → `PolicyNotFound`)
//! 2. Looks up the governing override; failures here are swallowed
//!    (fail-open: over-permissive beats over-restrictive)
//! 3. Short-circuits on a `temporary_ban`, otherwise applies the override
//!    transformation to an in-memory copy of the policy
//! 4. Builds the ordered check list over the six scopes, skipping scopes
//!    with no configured policy
//! 5. Dispatches: tenant-tagged keys as one batch, global keys as parallel
//!    singles, gated by the circuit breaker
//! 6. Aggregates by severity (ties → earlier check) into a `Decision`
//!
//! Store failures never surface: they trip the breaker and divert to the
//! process-local fallback limiter, so callers always get a decision unless
//! the policy backend itself is down.

use crate::circuit_breaker::CircuitBreaker;
use crate::engine::BucketBackend;
use crate::error::{LimiterError, Result};
use crate::fallback::FallbackLimiter;
use crate::script::{reset_epoch_s, retry_after_s, BucketParams, BucketVerdict};
use gatehouse_core::{
    keys, now_ms, BucketPolicy, CheckOutcome, Decision, GlobalPolicy, Override, OverrideType,
    RequestIdentity, Scope, TenantPolicy, ThrottleState,
};
use gatehouse_observability::metrics as obs;
use gatehouse_policy::{OverrideCache, PolicyCache};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct DecisionerConfig {
    /// Fixed soft threshold for the two global-scope checks.
    pub global_soft_pct: f64,
    /// Fixed hard threshold for the two global-scope checks.
    pub global_hard_pct: f64,
    /// TTL applied to bucket keys in the store.
    pub bucket_ttl: Duration,
}

impl Default for DecisionerConfig {
    fn default() -> Self {
        Self {
            global_soft_pct: 100.0,
            global_hard_pct: 110.0,
            bucket_ttl: Duration::from_secs(3600),
        }
    }
}

/// One entry of the check list: scope, bucket key, and the parameters the
/// primitive needs.
struct Check {
    scope: Scope,
    key: String,
    params: BucketParams,
    limit_rpm: u32,
}

/// Orchestrates policy resolution, bucket evaluation and aggregation.
pub struct Decisioner {
    policies: Arc<PolicyCache>,
    overrides: Arc<OverrideCache>,
    backend: Arc<dyn BucketBackend>,
    breaker: Arc<CircuitBreaker>,
    fallback: Arc<FallbackLimiter>,
    config: DecisionerConfig,
}

impl Decisioner {
    pub fn new(
        policies: Arc<PolicyCache>,
        overrides: Arc<OverrideCache>,
        backend: Arc<dyn BucketBackend>,
        breaker: Arc<CircuitBreaker>,
        fallback: Arc<FallbackLimiter>,
        config: DecisionerConfig,
    ) -> Self {
        Self {
            policies,
            overrides,
            backend,
            breaker,
            fallback,
            config,
        }
    }

    /// Produce the rate-limit decision for one request.
    pub async fn decide(&self, identity: &RequestIdentity) -> Result<Decision> {
        let mut policy = self
            .policies
            .get_tenant(&identity.tenant_id)
            .await?
            .ok_or_else(|| LimiterError::PolicyNotFound(identity.tenant_id.clone()))?;

        // Override lookup fails open: a broken override backend must not
        // turn into denied (or unlimited) traffic decisions.
        let active_override = match self
            .overrides
            .get_active(&identity.tenant_id, &identity.user_id, &identity.endpoint)
            .await
        {
            Ok(found) => found,
            Err(e) => {
                warn!(
                    tenant_id = %identity.tenant_id,
                    error = %e,
                    "override lookup failed; proceeding without override"
                );
                None
            }
        };

        if let Some(active) = &active_override {
            obs::OVERRIDE_APPLIED_TOTAL
                .with_label_values(&[active.override_type.as_str(), active.source.as_str()])
                .inc();

            if active.override_type == OverrideType::TemporaryBan {
                debug!(
                    tenant_id = %identity.tenant_id,
                    override_id = %active.id,
                    "temporary ban active; denying"
                );
                let now = now_ms();
                return Ok(Decision {
                    allowed: false,
                    state: ThrottleState::Hard,
                    scope: Scope::TenantGlobal,
                    limit: policy.tenant.rpm,
                    remaining: 0,
                    reset_epoch_s: (active.expires_at as u64).div_ceil(1000) as i64,
                    retry_after_s: Some(active.retry_after_s(now)),
                    checks: Vec::new(),
                });
            }

            apply_override(&mut policy, active);
        }

        let global = match self.policies.get_global().await? {
            Some(global) => global,
            None => GlobalPolicy::permissive(),
        };

        let checks = self.build_checks(&policy, &global, identity);

        match self.dispatch(&checks).await {
            Ok(verdicts) => {
                let outcomes = self.build_outcomes(&checks, &verdicts, identity);
                Decision::aggregate(outcomes)
                    .ok_or_else(|| LimiterError::Internal("empty check list".to_string()))
            }
            Err(e) if e.is_store_failure() => Ok(self.degrade(identity, &e).await),
            Err(e) => Err(e),
        }
    }

    /// Ordered check list, most-local scope first. Scopes without a
    /// configured policy are omitted.
    fn build_checks(
        &self,
        policy: &TenantPolicy,
        global: &GlobalPolicy,
        identity: &RequestIdentity,
    ) -> Vec<Check> {
        let tenant = &identity.tenant_id;
        let user = &identity.user_id;
        let endpoint = &identity.endpoint;
        let soft = policy.throttle.effective_soft();
        let hard = policy.throttle.hard_threshold_pct;
        let ttl_s = self.config.bucket_ttl.as_secs();

        let check = |scope: Scope, key: String, bucket: &BucketPolicy, soft: f64, hard: f64| Check {
            scope,
            key,
            limit_rpm: bucket.rpm,
            params: BucketParams {
                capacity: bucket.burst_capacity,
                refill_rate_per_sec: bucket.refill_rate(),
                soft_pct: soft,
                hard_pct: hard,
                ttl_s,
            },
        };

        let mut checks = Vec::with_capacity(6);

        if let Some(bucket) = &policy.user {
            checks.push(check(
                Scope::UserGlobal,
                keys::user_global(tenant, user),
                bucket,
                soft,
                hard,
            ));
        }
        if let Some(bucket) = policy.user_endpoints.get(endpoint) {
            checks.push(check(
                Scope::UserEndpoint,
                keys::user_endpoint(tenant, user, endpoint),
                bucket,
                soft,
                hard,
            ));
        }
        checks.push(check(
            Scope::TenantGlobal,
            keys::tenant_global(tenant),
            &policy.tenant,
            soft,
            hard,
        ));
        if let Some(bucket) = policy.tenant_endpoints.get(endpoint) {
            checks.push(check(
                Scope::TenantEndpoint,
                keys::tenant_endpoint(tenant, endpoint),
                bucket,
                soft,
                hard,
            ));
        }
        if let Some(bucket) = global.endpoints.get(endpoint) {
            checks.push(check(
                Scope::GlobalEndpoint,
                keys::global_endpoint(endpoint),
                bucket,
                self.config.global_soft_pct,
                self.config.global_hard_pct,
            ));
        }
        checks.push(check(
            Scope::GlobalSystem,
            keys::global_system(),
            &global.system,
            self.config.global_soft_pct,
            self.config.global_hard_pct,
        ));

        checks
    }

    /// Evaluate every check: hash-tagged keys as one batch on their shared
    /// partition, global keys as parallel singles. Results return in check
    /// order.
    async fn dispatch(&self, checks: &[Check]) -> Result<Vec<BucketVerdict>> {
        self.breaker.try_acquire()?;
        let started = Instant::now();

        let mut batch = Vec::new();
        let mut batch_slots = Vec::new();
        let mut single_slots = Vec::new();
        for (index, check) in checks.iter().enumerate() {
            if keys::has_tenant_tag(&check.key) {
                batch.push((check.key.clone(), check.params.clone()));
                batch_slots.push(index);
            } else {
                single_slots.push(index);
            }
        }

        let batch_fut = self.backend.check_batch(&batch);
        let singles_fut = futures::future::try_join_all(
            single_slots
                .iter()
                .map(|&index| self.backend.check(&checks[index].key, &checks[index].params)),
        );

        let result = futures::future::try_join(batch_fut, singles_fut).await;

        let (batch_verdicts, single_verdicts) = match result {
            Ok(verdicts) => {
                self.breaker.record_success();
                verdicts
            }
            Err(e) => {
                if e.is_store_failure() {
                    self.breaker.record_failure();
                }
                return Err(e);
            }
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        for check in checks {
            obs::CHECK_DURATION_MS
                .with_label_values(&[check.scope.as_str()])
                .observe(elapsed_ms);
        }

        let mut verdicts = vec![None; checks.len()];
        for (slot, verdict) in batch_slots.into_iter().zip(batch_verdicts) {
            verdicts[slot] = Some(verdict);
        }
        for (slot, verdict) in single_slots.into_iter().zip(single_verdicts) {
            verdicts[slot] = Some(verdict);
        }
        Ok(verdicts.into_iter().flatten().collect())
    }

    fn build_outcomes(
        &self,
        checks: &[Check],
        verdicts: &[BucketVerdict],
        identity: &RequestIdentity,
    ) -> Vec<CheckOutcome> {
        let now = now_ms();
        checks
            .iter()
            .zip(verdicts)
            .map(|(check, verdict)| {
                obs::BUCKET_TOKENS
                    .with_label_values(&[check.scope.as_str(), &identity.tenant_id])
                    .set(verdict.tokens);
                obs::BUCKET_USAGE_PCT
                    .with_label_values(&[
                        check.scope.as_str(),
                        &identity.tenant_id,
                        &identity.endpoint,
                    ])
                    .set(verdict.usage_pct);

                let retry_after_s = (verdict.state == ThrottleState::Hard).then(|| {
                    retry_after_s(
                        verdict.tokens,
                        check.params.capacity,
                        check.params.refill_rate_per_sec,
                        check.params.hard_pct,
                    )
                });

                CheckOutcome {
                    scope: check.scope,
                    key: check.key.clone(),
                    allowed: verdict.allowed,
                    state: verdict.state,
                    tokens_remaining: verdict.tokens,
                    usage_pct: verdict.usage_pct,
                    limit: check.limit_rpm,
                    reset_epoch_s: reset_epoch_s(
                        now,
                        verdict.tokens,
                        check.params.capacity,
                        check.params.refill_rate_per_sec,
                    ),
                    retry_after_s,
                }
            })
            .collect()
    }

    async fn degrade(&self, identity: &RequestIdentity, error: &LimiterError) -> Decision {
        let reason = error.fallback_reason();
        warn!(
            tenant_id = %identity.tenant_id,
            reason,
            error = %error,
            "store unavailable; using fallback limiter"
        );
        obs::FALLBACK_ACTIVATIONS_TOTAL
            .with_label_values(&[reason])
            .inc();
        self.fallback.check(&identity.tenant_id).await
    }
}

/// Apply a non-ban override to an in-memory copy of the tenant policy.
/// Never persisted.
fn apply_override(policy: &mut TenantPolicy, active: &Override) {
    match active.override_type {
        OverrideType::PenaltyMultiplier => {
            let multiplier = active.penalty_multiplier.unwrap_or(1.0);
            policy.tenant = policy.tenant.scaled(multiplier);
            if let Some(user) = &policy.user {
                policy.user = Some(user.scaled(multiplier));
            }
        }
        OverrideType::CustomLimit => {
            let (Some(rate), Some(burst)) = (active.custom_rate, active.custom_burst) else {
                return;
            };
            let custom = BucketPolicy {
                rpm: rate,
                rps: rate as f64 / 60.0,
                burst_capacity: burst,
                refill_rate_per_sec: Some(rate as f64 / 60.0),
            };
            match (active.user_id.as_deref(), active.endpoint.as_deref()) {
                (Some(_), Some(endpoint)) => {
                    policy.user_endpoints.insert(endpoint.to_string(), custom);
                }
                (Some(_), None) => policy.user = Some(custom),
                (None, Some(endpoint)) => {
                    policy.tenant_endpoints.insert(endpoint.to_string(), custom);
                }
                (None, None) => policy.tenant = custom,
            }
        }
        OverrideType::TemporaryBan => {}
    }
}
