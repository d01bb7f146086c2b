/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: src/controllers/custom_metrics.rs
 *
 * Reads the current value of a Service-scoped custom metric through the
 * custom.metrics.k8s.io aggregated API, and turns it into the number of
 * replicas this controller wants: zero when the metric is zero, one when it
 * is positive. Anything above one is the HPA's business.
 *
 * Metric values are never cached; every evaluation reads them afresh.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use crate::error::{api_status, Error, Result};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::Client;
use serde::Deserialize;
use std::future::Future;
use tracing::debug;

/// Read access to custom metric values.
pub trait MetricsApi: Send + Sync {
    /// Returns the current value of the metric at `path`.
    ///
    /// Not found, forbidden and adapter-unavailable answers all yield
    /// `MetricUnavailable`; any other API failure is fatal.
    fn read_metric(&self, path: &str) -> impl Future<Output = Result<i64>> + Send;
}

/// Replicas wanted for a metric value: 1 for positive values, 0 for zero.
/// Negative values are passed through and never match a scaling intent.
pub fn desired_replicas(metric_value: i64) -> i32 {
    metric_value.clamp(i32::MIN as i64, 1) as i32
}

/// `MetricValueList` as served by custom.metrics.k8s.io/v1beta1.
#[derive(Deserialize, Debug)]
struct MetricValueList {
    #[serde(default)]
    items: Vec<MetricValue>,
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct MetricValue {
    #[serde(default)]
    metric_name: Option<String>,
    value: Quantity,
}

/// `MetricsApi` backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeMetricsClient {
    client: Client,
}

impl KubeMetricsClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl MetricsApi for KubeMetricsClient {
    async fn read_metric(&self, path: &str) -> Result<i64> {
        let unavailable = |reason: String| Error::MetricUnavailable {
            path: path.to_string(),
            reason,
        };

        let request = http::Request::get(format!("/{}", path.trim_start_matches('/')))
            .body(Vec::new())
            .map_err(|e| unavailable(format!("invalid request: {e}")))?;

        let list: MetricValueList = match self.client.request(request).await {
            Ok(list) => list,
            Err(e) => match api_status(&e) {
                Some(code @ (403 | 404 | 503)) => return Err(unavailable(format!("HTTP {code}: {e}"))),
                _ => return Err(Error::KubeError(e)),
            },
        };

        value_of(list).map_err(unavailable)
    }
}

fn value_of(list: MetricValueList) -> std::result::Result<i64, String> {
    if list.items.len() > 1 {
        debug!(count = list.items.len(), "Metric list holds several values, using the first one");
    }
    let item = list
        .items
        .into_iter()
        .next()
        .ok_or_else(|| "metric list is empty".to_string())?;
    parse_quantity(&item.value.0).ok_or_else(|| {
        format!(
            "value '{}' of metric {} is not a quantity",
            item.value.0,
            item.metric_name.as_deref().unwrap_or("<unnamed>")
        )
    })
}

/// Parses a Kubernetes quantity into an integer, rounding away from zero so
/// that any fractional activity (e.g. `500m`) counts as nonzero.
pub fn parse_quantity(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
        .unwrap_or(raw.len());
    let (number, suffix) = raw.split_at(split);
    let number: f64 = number.parse().ok()?;

    let multiplier = match suffix {
        "" => 1.0,
        "n" => 1e-9,
        "u" => 1e-6,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => 1024.0,
        "Mi" => 1024.0 * 1024.0,
        "Gi" => 1024.0 * 1024.0 * 1024.0,
        "Ti" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => {
            // Decimal exponent form, e.g. "12e3".
            let exponent: i32 = suffix.strip_prefix(['e', 'E'])?.parse().ok()?;
            10f64.powi(exponent)
        }
    };

    let value = number * multiplier;
    if !value.is_finite() {
        return None;
    }
    let rounded = if value > 0.0 { value.ceil() } else { value.floor() };
    Some(rounded as i64)
}
