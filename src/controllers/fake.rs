/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: src/controllers/fake.rs
 *
 * An in-memory cluster implementing the three API seams of the controller
 * (`ScaleApi`, `MetricsApi`, `HpaApi`). Replica counts and metric values are
 * timelines relative to the creation of the fake, so scenarios can be
 * scripted against tokio's paused clock.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use super::custom_metrics::MetricsApi;
use super::discovery::{HpaApi, HpaEventStream};
use super::scale_target::ScaleApi;
use crate::error::{api_error, Error, Result};
use crate::hpa::{metric_value_path, namespaced_name, ScaleTarget, TargetKind, TrackedHpa};
use futures::stream::{self, StreamExt};
use k8s_openapi::api::autoscaling::v1::{HorizontalPodAutoscaler, Scale, ScaleSpec, ScaleStatus};
use kube::api::{ObjectMeta, WatchEvent};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

pub type WatchScript = Vec<std::result::Result<WatchEvent<HorizontalPodAutoscaler>, kube::Error>>;

/// Values that change at given offsets from the start of the scenario.
struct Timeline<T> {
    points: Vec<(Duration, T)>,
}

impl<T: Copy> Timeline<T> {
    fn starting_at(value: T) -> Self {
        Self {
            points: vec![(Duration::ZERO, value)],
        }
    }

    fn set(&mut self, at: Duration, value: T) {
        let index = self
            .points
            .iter()
            .position(|(offset, _)| *offset > at)
            .unwrap_or(self.points.len());
        self.points.insert(index, (at, value));
    }

    fn value_at(&self, elapsed: Duration) -> T {
        self.points
            .iter()
            .rev()
            .find(|(offset, _)| *offset <= elapsed)
            .map(|(_, value)| *value)
            .unwrap_or(self.points[0].1)
    }
}

struct TargetState {
    replicas: Timeline<i32>,
    deleted: bool,
}

struct MetricState {
    values: Timeline<i64>,
    reads: usize,
    unavailable: bool,
}

#[derive(Default)]
struct State {
    targets: HashMap<String, TargetState>,
    metrics: HashMap<String, MetricState>,
    patches: usize,
    patch_failure: Option<u16>,
    hpas: HashMap<String, HorizontalPodAutoscaler>,
    hpa_read_failure: Option<u16>,
    watch_scripts: VecDeque<WatchScript>,
    watch_calls: Vec<String>,
}

#[derive(Clone)]
pub struct FakeCluster {
    start: Instant,
    state: Arc<Mutex<State>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    /// Registers a Deployment named after the HPA, with `replicas` running and
    /// its Service metric `foo_metric` at `metric`, and returns the entry
    /// discovery would have tracked for it.
    pub fn deployment(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
        metric: i64,
        scale_up_window: Duration,
        scale_down_window: Duration,
    ) -> TrackedHpa {
        let hpa = TrackedHpa {
            namespace: namespace.to_string(),
            name: name.to_string(),
            metric_path: metric_value_path(namespace, name, "foo_metric"),
            target: ScaleTarget {
                kind: TargetKind::Deployment,
                namespace: namespace.to_string(),
                name: name.to_string(),
            },
            scale_up_window,
            scale_down_window,
        };

        let mut state = self.lock();
        state.targets.insert(
            hpa.target.to_string(),
            TargetState {
                replicas: Timeline::starting_at(replicas),
                deleted: false,
            },
        );
        state.metrics.insert(
            hpa.metric_path.clone(),
            MetricState {
                values: Timeline::starting_at(metric),
                reads: 0,
                unavailable: false,
            },
        );
        hpa
    }

    pub fn replicas(&self, target: &ScaleTarget) -> i32 {
        let elapsed = self.start.elapsed();
        self.lock().targets[&target.to_string()].replicas.value_at(elapsed)
    }

    pub fn set_metric_at(&self, path: &str, at: Duration, value: i64) {
        if let Some(metric) = self.lock().metrics.get_mut(path) {
            metric.values.set(at, value);
        }
    }

    /// Simulates another actor changing the replica count at `at`.
    pub fn set_replicas_at(&self, target: &ScaleTarget, at: Duration, replicas: i32) {
        if let Some(t) = self.lock().targets.get_mut(&target.to_string()) {
            t.replicas.set(at, replicas);
        }
    }

    pub fn metric_reads(&self, path: &str) -> usize {
        self.lock().metrics.get(path).map(|m| m.reads).unwrap_or(0)
    }

    pub fn patch_count(&self) -> usize {
        self.lock().patches
    }

    pub fn delete_target(&self, target: &ScaleTarget) {
        if let Some(t) = self.lock().targets.get_mut(&target.to_string()) {
            t.deleted = true;
        }
    }

    pub fn make_metric_unavailable(&self, path: &str) {
        if let Some(metric) = self.lock().metrics.get_mut(path) {
            metric.unavailable = true;
        }
    }

    pub fn fail_patches_with(&self, code: u16) {
        self.lock().patch_failure = Some(code);
    }

    pub fn put_hpa(&self, hpa: HorizontalPodAutoscaler) {
        let key = namespaced_name(
            hpa.metadata.namespace.as_deref().unwrap_or_default(),
            hpa.metadata.name.as_deref().unwrap_or_default(),
        );
        self.lock().hpas.insert(key, hpa);
    }

    pub fn delete_hpa(&self, namespace: &str, name: &str) {
        self.lock().hpas.remove(&namespaced_name(namespace, name));
    }

    pub fn fail_hpa_reads_with(&self, code: u16) {
        self.lock().hpa_read_failure = Some(code);
    }

    /// Queues the events served by the next watch call. Once every script
    /// has been served, watch calls return a stream that never yields.
    pub fn push_watch(&self, script: WatchScript) {
        self.lock().watch_scripts.push_back(script);
    }

    /// Resource versions the watch was opened with, in call order.
    pub fn watch_calls(&self) -> Vec<String> {
        self.lock().watch_calls.clone()
    }

    fn not_found(target: &ScaleTarget) -> Error {
        Error::TargetNotFound {
            kind: target.kind,
            namespace: target.namespace.clone(),
            name: target.name.clone(),
        }
    }
}

impl ScaleApi for FakeCluster {
    async fn read_scale(&self, target: &ScaleTarget) -> Result<Scale> {
        let elapsed = self.start.elapsed();
        let state = self.lock();
        let replicas = match state.targets.get(&target.to_string()) {
            Some(t) if !t.deleted => t.replicas.value_at(elapsed),
            _ => return Err(Self::not_found(target)),
        };
        Ok(Scale {
            metadata: ObjectMeta {
                name: Some(target.name.clone()),
                namespace: Some(target.namespace.clone()),
                resource_version: Some("1".to_string()),
                ..Default::default()
            },
            spec: Some(ScaleSpec {
                replicas: Some(replicas),
            }),
            status: Some(ScaleStatus {
                replicas,
                selector: None,
            }),
        })
    }

    async fn patch_scale(&self, target: &ScaleTarget, scale: &Scale) -> Result<Scale> {
        let elapsed = self.start.elapsed();
        {
            let mut state = self.lock();
            if let Some(code) = state.patch_failure {
                return Err(Error::KubeError(api_error(code)));
            }
            let replicas = scale.spec.as_ref().and_then(|s| s.replicas).unwrap_or(0);
            match state.targets.get_mut(&target.to_string()) {
                Some(t) if !t.deleted => t.replicas.set(elapsed, replicas),
                _ => return Err(Self::not_found(target)),
            }
            state.patches += 1;
        }
        self.read_scale(target).await
    }
}

impl MetricsApi for FakeCluster {
    async fn read_metric(&self, path: &str) -> Result<i64> {
        let elapsed = self.start.elapsed();
        let mut state = self.lock();
        let unavailable = |reason: &str| Error::MetricUnavailable {
            path: path.to_string(),
            reason: reason.to_string(),
        };
        let metric = state
            .metrics
            .get_mut(path)
            .ok_or_else(|| unavailable("HTTP 404: metric not found"))?;
        metric.reads += 1;
        if metric.unavailable {
            return Err(unavailable("HTTP 503: adapter unavailable"));
        }
        Ok(metric.values.value_at(elapsed))
    }
}

impl HpaApi for FakeCluster {
    async fn get_hpa(&self, namespace: &str, name: &str) -> Result<HorizontalPodAutoscaler> {
        let state = self.lock();
        if let Some(code) = state.hpa_read_failure {
            return Err(Error::KubeError(api_error(code)));
        }
        state
            .hpas
            .get(&namespaced_name(namespace, name))
            .cloned()
            .ok_or_else(|| Error::HpaNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    async fn watch_hpas(&self, resource_version: &str) -> Result<HpaEventStream> {
        let mut state = self.lock();
        state.watch_calls.push(resource_version.to_string());
        Ok(match state.watch_scripts.pop_front() {
            Some(script) => stream::iter(script).boxed(),
            None => stream::pending().boxed(),
        })
    }
}
