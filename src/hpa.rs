/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: src/hpa.rs
 *
 * This file defines the controller's view of a watched HorizontalPodAutoscaler
 * and the resolution of its metric annotation into a custom metrics API path.
 *
 * Only one metric shape is supported: a single `Object` metric, without
 * selector, whose described object is a `Service` in the HPA's namespace.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use crate::config::{ControllerConfig, METRICS_ANNOTATION};
use crate::error::{Error, Result};
use k8s_openapi::api::autoscaling::v1::HorizontalPodAutoscaler;
use kube::ResourceExt;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Workload kinds whose scale subresource the controller knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TargetKind {
    Deployment,
    StatefulSet,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::Deployment => "Deployment",
            TargetKind::StatefulSet => "StatefulSet",
        }
    }
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "Deployment" => Ok(TargetKind::Deployment),
            "StatefulSet" => Ok(TargetKind::StatefulSet),
            other => Err(Error::UnsupportedTargetKind(other.to_string())),
        }
    }
}

/// The workload scaled on behalf of an HPA.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleTarget {
    pub kind: TargetKind,
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ScaleTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// An HPA admitted to the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedHpa {
    pub namespace: String,
    pub name: String,
    /// Path of the metric on the custom metrics API, relative to the API server root.
    pub metric_path: String,
    pub target: ScaleTarget,
    pub scale_up_window: Duration,
    pub scale_down_window: Duration,
}

impl TrackedHpa {
    /// Registry key: `namespace/name`.
    pub fn key(&self) -> String {
        namespaced_name(&self.namespace, &self.name)
    }

    /// Resolves a freshly read HPA into a tracked entry.
    ///
    /// Fails with `ResolutionRejected` when the metric annotation is missing or
    /// does not have the supported shape, and with `UnsupportedTargetKind` when
    /// the HPA scales something other than a Deployment or a StatefulSet.
    pub fn resolve(hpa: &HorizontalPodAutoscaler, config: &ControllerConfig) -> Result<Self> {
        let namespace = hpa.namespace().unwrap_or_else(|| config.hpa_namespace.clone());
        let name = hpa.name_any();
        let reject = |reason: String| Error::ResolutionRejected {
            namespace: namespace.clone(),
            name: name.clone(),
            reason,
        };

        let raw = hpa
            .annotations()
            .get(METRICS_ANNOTATION)
            .ok_or_else(|| reject(format!("annotation {METRICS_ANNOTATION} is missing")))?;
        let metric = ObjectMetric::from_annotation(raw).map_err(reject)?;

        let target_ref = hpa
            .spec
            .as_ref()
            .map(|spec| &spec.scale_target_ref)
            .ok_or_else(|| reject("spec.scaleTargetRef is missing".to_string()))?;
        let kind = target_ref.kind.parse::<TargetKind>()?;

        Ok(Self {
            metric_path: metric_value_path(&namespace, &metric.target.name, &metric.metric_name),
            target: ScaleTarget {
                kind,
                namespace: namespace.clone(),
                name: target_ref.name.clone(),
            },
            namespace,
            name,
            scale_up_window: config.scale_up_window,
            scale_down_window: config.scale_down_window,
        })
    }
}

pub fn namespaced_name(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Returns the custom.metrics.k8s.io path of a metric describing a Service.
pub fn metric_value_path(service_namespace: &str, service_name: &str, metric_name: &str) -> String {
    format!(
        "apis/custom.metrics.k8s.io/v1beta1/namespaces/{service_namespace}/services/{service_name}/{metric_name}"
    )
}

// --- Annotation Structures ---

/// One element of the metrics annotation. Only `Object` entries are inspected.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct MetricSpec {
    #[serde(rename = "type")]
    type_: String,
    #[serde(default)]
    object: Option<ObjectMetric>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct ObjectMetric {
    target: ObjectReference,
    metric_name: String,
    #[serde(default)]
    selector: Option<serde_json::Value>,
}

#[derive(Deserialize, Debug, Clone)]
struct ObjectReference {
    kind: String,
    name: String,
}

impl ObjectMetric {
    /// Extracts the single supported metric from the annotation value.
    ///
    /// Only qualifying entries count: `Object` metrics without selector
    /// describing a `Service`. Exactly one of them must be present.
    fn from_annotation(raw: &str) -> std::result::Result<Self, String> {
        let specs: Vec<MetricSpec> =
            serde_json::from_str(raw).map_err(|e| format!("malformed metrics annotation: {e}"))?;

        let objects: Vec<ObjectMetric> = specs
            .into_iter()
            .filter(|m| m.type_ == "Object")
            .filter_map(|m| m.object)
            .collect();
        let object_count = objects.len();

        let mut qualifying = objects.into_iter().filter(ObjectMetric::is_supported);
        match (qualifying.next(), qualifying.next()) {
            (Some(metric), None) => Ok(metric),
            (Some(_), Some(_)) => {
                Err("more than one Object metric on a Service without selector".to_string())
            }
            (None, _) if object_count == 0 => Err("no Object metric found".to_string()),
            (None, _) => Err(format!(
                "none of the {object_count} Object metric(s) describes a Service without selector"
            )),
        }
    }

    fn is_supported(&self) -> bool {
        self.target.kind == "Service" && selector_is_empty(self.selector.as_ref())
    }
}

fn selector_is_empty(selector: Option<&serde_json::Value>) -> bool {
    match selector {
        None | Some(serde_json::Value::Null) => true,
        Some(serde_json::Value::Object(map)) => map.values().all(|v| match v {
            serde_json::Value::Null => true,
            serde_json::Value::Object(m) => m.is_empty(),
            serde_json::Value::Array(a) => a.is_empty(),
            _ => false,
        }),
        Some(_) => false,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use k8s_openapi::api::autoscaling::v1::{
        CrossVersionObjectReference, HorizontalPodAutoscalerSpec,
    };
    use kube::api::ObjectMeta;

    pub(crate) fn service_metric(service: &str, metric: &str) -> String {
        serde_json::json!([{
            "type": "Object",
            "object": {
                "target": {"kind": "Service", "name": service},
                "metricName": metric,
                "targetValue": "1"
            }
        }])
        .to_string()
    }

    pub(crate) fn build_hpa(
        namespace: &str,
        name: &str,
        target_kind: &str,
        annotation: Option<String>,
    ) -> HorizontalPodAutoscaler {
        HorizontalPodAutoscaler {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                annotations: annotation.map(|a| [(METRICS_ANNOTATION.to_string(), a)].into()),
                resource_version: Some("1".to_string()),
                ..Default::default()
            },
            spec: Some(HorizontalPodAutoscalerSpec {
                scale_target_ref: CrossVersionObjectReference {
                    api_version: Some("apps/v1".to_string()),
                    kind: target_kind.to_string(),
                    name: name.to_string(),
                },
                min_replicas: Some(1),
                max_replicas: 5,
                ..Default::default()
            }),
            status: None,
        }
    }

    fn config() -> ControllerConfig {
        ControllerConfig {
            scale_up_window: Duration::from_secs(15),
            ..ControllerConfig::default()
        }
    }

    #[test]
    fn test_resolve_service_metric() {
        let hpa = build_hpa("ns", "a", "Deployment", Some(service_metric("svc", "foo_metric")));
        let tracked = TrackedHpa::resolve(&hpa, &config()).unwrap();

        assert_eq!(tracked.key(), "ns/a");
        assert_eq!(
            tracked.metric_path,
            "apis/custom.metrics.k8s.io/v1beta1/namespaces/ns/services/svc/foo_metric"
        );
        assert_eq!(tracked.target.kind, TargetKind::Deployment);
        assert_eq!(tracked.target.name, "a");
        assert_eq!(tracked.scale_up_window, Duration::from_secs(15));
        assert_eq!(tracked.scale_down_window, Duration::ZERO);
    }

    #[test]
    fn test_statefulset_target() {
        let hpa = build_hpa("ns", "db", "StatefulSet", Some(service_metric("db", "qps")));
        let tracked = TrackedHpa::resolve(&hpa, &config()).unwrap();
        assert_eq!(tracked.target.kind, TargetKind::StatefulSet);
    }

    #[test]
    fn test_other_metric_types_are_ignored() {
        let annotation = serde_json::json!([
            {"type": "Resource", "resource": {"name": "cpu", "targetAverageUtilization": 80}},
            {"type": "Object", "object": {"target": {"kind": "Service", "name": "svc"}, "metricName": "m", "selector": {}}}
        ])
        .to_string();
        let hpa = build_hpa("ns", "a", "Deployment", Some(annotation));
        assert!(TrackedHpa::resolve(&hpa, &config()).is_ok());
    }

    fn rejected(annotation: Option<String>) -> bool {
        let hpa = build_hpa("ns", "a", "Deployment", annotation);
        matches!(
            TrackedHpa::resolve(&hpa, &config()),
            Err(Error::ResolutionRejected { .. })
        )
    }

    #[test]
    fn test_rejected_shapes() {
        // Missing annotation and malformed JSON.
        assert!(rejected(None));
        assert!(rejected(Some("not json".to_string())));
        // No Object metric.
        assert!(rejected(Some(
            serde_json::json!([{"type": "Resource", "resource": {"name": "cpu"}}]).to_string()
        )));
        // Two Object metrics.
        let two = serde_json::json!([
            {"type": "Object", "object": {"target": {"kind": "Service", "name": "a"}, "metricName": "m"}},
            {"type": "Object", "object": {"target": {"kind": "Service", "name": "b"}, "metricName": "m"}}
        ]);
        assert!(rejected(Some(two.to_string())));
        // Selector present.
        let selector = serde_json::json!([
            {"type": "Object", "object": {
                "target": {"kind": "Service", "name": "a"},
                "metricName": "m",
                "selector": {"matchLabels": {"app": "a"}}
            }}
        ]);
        assert!(rejected(Some(selector.to_string())));
        // Not a Service.
        let ingress = serde_json::json!([
            {"type": "Object", "object": {"target": {"kind": "Ingress", "name": "a"}, "metricName": "m"}}
        ]);
        assert!(rejected(Some(ingress.to_string())));
    }

    #[test]
    fn test_only_qualifying_object_metrics_count() {
        let annotation = serde_json::json!([
            {"type": "Object", "object": {"target": {"kind": "Service", "name": "svc"}, "metricName": "m"}},
            {"type": "Object", "object": {"target": {"kind": "Ingress", "name": "ing"}, "metricName": "hits"}},
            {"type": "Object", "object": {
                "target": {"kind": "Service", "name": "other"},
                "metricName": "m",
                "selector": {"matchLabels": {"app": "a"}}
            }}
        ])
        .to_string();
        let hpa = build_hpa("ns", "a", "Deployment", Some(annotation));

        let tracked = TrackedHpa::resolve(&hpa, &config()).unwrap();
        assert_eq!(
            tracked.metric_path,
            "apis/custom.metrics.k8s.io/v1beta1/namespaces/ns/services/svc/m"
        );
    }

    #[test]
    fn test_target_is_the_scale_target_ref() {
        let mut hpa = build_hpa("ns", "a", "Deployment", Some(service_metric("svc", "m")));
        if let Some(spec) = hpa.spec.as_mut() {
            spec.scale_target_ref.name = "web".to_string();
        }

        let tracked = TrackedHpa::resolve(&hpa, &config()).unwrap();
        assert_eq!(tracked.key(), "ns/a");
        assert_eq!(tracked.target.name, "web");
        assert_eq!(tracked.target.to_string(), "Deployment ns/web");
    }

    #[test]
    fn test_unsupported_target_kind() {
        let hpa = build_hpa("ns", "a", "ReplicaSet", Some(service_metric("svc", "m")));
        let err = TrackedHpa::resolve(&hpa, &config()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedTargetKind(ref k) if k == "ReplicaSet"));
        assert!(err.is_fatal());
    }
}
