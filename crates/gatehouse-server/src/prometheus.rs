//! Prometheus query client
//!
//! The abuse detector needs exactly one thing from the telemetry backend:
//! per-tenant `throttled / total` ratios over a trailing window. This
//! client speaks just enough of the Prometheus query API for that — an
//! instant query whose reply must be a vector of samples labelled with
//! `tenant_id`. Matrix and scalar replies have no consumer here and are
//! rejected as malformed rather than modelled.

use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

/// Minimal client for the Prometheus instant-query endpoint.
#[derive(Clone)]
pub struct PrometheusClient {
    client: reqwest::Client,
    base_url: String,
}

/// Envelope of `/api/v1/query`.
#[derive(Debug, Deserialize)]
struct QueryReply {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(rename = "resultType")]
    result_type: String,
    #[serde(default)]
    result: Vec<Sample>,
}

/// One instant-vector sample: a label set plus a `(timestamp, value)`
/// pair, the value arriving as a string.
#[derive(Debug, Deserialize)]
struct Sample {
    #[serde(default)]
    metric: HashMap<String, String>,
    value: (f64, String),
}

/// One tenant's throttled/total ratio over the query window.
#[derive(Debug, Clone, PartialEq)]
pub struct TenantThrottleRatio {
    pub tenant_id: String,
    pub ratio: f64,
}

/// Prometheus query errors
#[derive(Debug, Error)]
pub enum PrometheusError {
    #[error("telemetry backend unreachable: {0}")]
    Unreachable(String),

    #[error("telemetry backend answered HTTP {0}")]
    BadStatus(u16),

    #[error("unusable query reply: {0}")]
    Malformed(String),
}

impl PrometheusClient {
    pub fn new(prometheus_url: &str) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client with static settings");

        Self {
            client,
            base_url: prometheus_url.trim_end_matches('/').to_string(),
        }
    }

    /// Per-tenant `throttled / total` request ratio over the last
    /// `window_minutes` minutes.
    pub async fn tenant_throttle_ratios(
        &self,
        window_minutes: u32,
    ) -> Result<Vec<TenantThrottleRatio>, PrometheusError> {
        let samples = self
            .query_vector(&throttle_ratio_query(window_minutes))
            .await?;
        Ok(ratios_from_samples(samples))
    }

    /// Run one instant query and demand a vector back.
    async fn query_vector(&self, promql: &str) -> Result<Vec<Sample>, PrometheusError> {
        let response = self
            .client
            .get(format!("{}/api/v1/query", self.base_url))
            .query(&[("query", promql)])
            .send()
            .await
            .map_err(|e| PrometheusError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PrometheusError::BadStatus(status.as_u16()));
        }

        let reply: QueryReply = response
            .json()
            .await
            .map_err(|e| PrometheusError::Malformed(e.to_string()))?;

        if reply.status != "success" {
            return Err(PrometheusError::Malformed(format!(
                "query status was {:?}",
                reply.status
            )));
        }
        match reply.data {
            Some(data) if data.result_type == "vector" => Ok(data.result),
            Some(data) => Err(PrometheusError::Malformed(format!(
                "expected a vector, got {:?}",
                data.result_type
            ))),
            None => Ok(Vec::new()),
        }
    }
}

/// PromQL for the per-tenant throttle ratio.
pub fn throttle_ratio_query(window_minutes: u32) -> String {
    format!(
        "sum by (tenant_id) (increase(gatehouse_requests_total{{result=~\"throttled_soft|throttled_hard\"}}[{w}m])) \
         / \
         sum by (tenant_id) (increase(gatehouse_requests_total[{w}m]))",
        w = window_minutes
    )
}

/// Keep the samples the detector can act on: a `tenant_id` label and a
/// finite numeric value. Everything else (aggregation artifacts, NaN from
/// zero-traffic divisions) is dropped.
fn ratios_from_samples(samples: Vec<Sample>) -> Vec<TenantThrottleRatio> {
    samples
        .into_iter()
        .filter_map(|mut sample| {
            let tenant_id = sample.metric.remove("tenant_id")?;
            let ratio: f64 = sample.value.1.parse().ok()?;
            ratio.is_finite().then_some(TenantThrottleRatio { tenant_id, ratio })
        })
        .collect()
}
