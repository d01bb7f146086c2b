/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: src/controllers/stabilization.rs
 *
 * The scaling decision for a single tracked HPA.
 *
 * Architecture:
 * 1.  **Classification**: the current replica count (scale status) and the
 *     desired one (derived from the custom metric) give the intent: scale up
 *     from zero, scale down to zero, or nothing to do.
 * 2.  **Stabilization**: when the window configured for that direction is
 *     non-zero, the state is re-read every poll interval until the window
 *     elapses. As soon as current and desired agree on being zero or not, the
 *     pending scale is canceled. Only the zero/non-zero property is compared,
 *     so the HPA may keep moving the replica count above one meanwhile.
 * 3.  **Application**: the scale object and the metric are read one last time
 *     and the freshest desired count is patched in.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use super::custom_metrics::{desired_replicas, MetricsApi};
use super::scale_target::{current_replicas, with_replicas, ScaleApi};
use crate::error::Result;
use crate::hpa::TrackedHpa;
use crate::metrics::{SCALE_OPERATIONS_TOTAL, STABILIZATIONS_CANCELED_TOTAL};
use crate::shutdown::Shutdown;
use k8s_openapi::api::autoscaling::v1::Scale;
use std::fmt;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{info, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current and desired replica counts, as read at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaleState {
    pub current: i32,
    pub desired: i32,
}

impl ScaleState {
    /// The scaling this controller is responsible for, if any.
    pub fn intent(&self) -> Option<Direction> {
        if self.current < self.desired && self.desired == 1 {
            Some(Direction::Up)
        } else if self.current > self.desired && self.desired == 0 {
            Some(Direction::Down)
        } else {
            None
        }
    }

    /// Current and desired agree on whether the workload runs at all.
    pub fn is_settled(&self) -> bool {
        (self.current != 0) == (self.desired != 0)
    }
}

/// Result of one evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing to do.
    Stable(ScaleState),
    /// An intent was detected but did not persist through its window.
    Canceled(Direction),
    /// Shutdown was requested while a stabilization window was pending.
    Interrupted,
    /// The scale subresource was patched.
    Scaled {
        direction: Direction,
        from: i32,
        to: i32,
    },
}

pub struct Evaluator<S, M> {
    scales: S,
    metrics: M,
    poll_interval: Duration,
    shutdown: Shutdown,
}

impl<S: ScaleApi, M: MetricsApi> Evaluator<S, M> {
    pub fn new(scales: S, metrics: M, poll_interval: Duration, shutdown: Shutdown) -> Self {
        Self {
            scales,
            metrics,
            poll_interval,
            shutdown,
        }
    }

    /// Reads the scale object of the target, then the custom metric.
    ///
    /// A missing target short-circuits with `TargetNotFound` before the
    /// metric is queried.
    pub async fn read_state(&self, hpa: &TrackedHpa) -> Result<(Scale, ScaleState)> {
        let scale = self.scales.read_scale(&hpa.target).await?;
        let metric_value = self.metrics.read_metric(&hpa.metric_path).await?;
        let state = ScaleState {
            current: current_replicas(&scale),
            desired: desired_replicas(metric_value),
        };
        Ok((scale, state))
    }

    /// Decides whether `hpa`'s target must be scaled, waits for the
    /// stabilization window if one applies, and patches the target.
    ///
    /// Transient failures (`TargetNotFound`, `MetricUnavailable`) are returned
    /// as errors like fatal ones; the caller tells them apart.
    #[instrument(skip(self, hpa), fields(kind = %hpa.target.kind, namespace = %hpa.namespace, name = %hpa.target.name))]
    pub async fn evaluate(&self, hpa: &TrackedHpa) -> Result<Outcome> {
        let (_, state) = self.read_state(hpa).await?;

        let Some(direction) = state.intent() else {
            info!(
                current = state.current,
                desired = state.desired,
                "No need to scale {}",
                hpa.target
            );
            return Ok(Outcome::Stable(state));
        };

        let window = match direction {
            Direction::Up => hpa.scale_up_window,
            Direction::Down => hpa.scale_down_window,
        };

        if !window.is_zero() {
            info!(
                current = state.current,
                desired = state.desired,
                window_secs = window.as_secs(),
                "{} will be scaled {}. Waiting for stabilization...",
                hpa.target,
                direction
            );
            if let Some(outcome) = self.stabilize(hpa, direction, window).await? {
                return Ok(outcome);
            }
        }

        self.apply(hpa).await
    }

    /// Polls until `window` elapses. Returns `None` when the intent held for
    /// the whole window, or the outcome that ended the wait early.
    async fn stabilize(
        &self,
        hpa: &TrackedHpa,
        direction: Direction,
        window: Duration,
    ) -> Result<Option<Outcome>> {
        // A window too large to be represented never elapses.
        let deadline = Instant::now().checked_add(window);
        let mut shutdown = self.shutdown.clone();

        while deadline.map_or(true, |deadline| Instant::now() < deadline) {
            let (_, state) = self.read_state(hpa).await?;
            if state.is_settled() {
                info!(
                    current = state.current,
                    desired = state.desired,
                    "{} scale is canceled due to stabilization.",
                    hpa.target
                );
                STABILIZATIONS_CANCELED_TOTAL
                    .with_label_values(&[direction.as_str()])
                    .inc();
                return Ok(Some(Outcome::Canceled(direction)));
            }

            tokio::select! {
                _ = sleep(self.poll_interval) => {}
                _ = shutdown.triggered() => {
                    info!("{} stabilization interrupted by shutdown.", hpa.target);
                    return Ok(Some(Outcome::Interrupted));
                }
            }
        }
        Ok(None)
    }

    /// Patches the target with the freshest desired replica count.
    async fn apply(&self, hpa: &TrackedHpa) -> Result<Outcome> {
        let (scale, state) = self.read_state(hpa).await?;
        let Some(direction) = state.intent() else {
            // The metric moved between confirmation and now; nothing left to do.
            return Ok(Outcome::Stable(state));
        };

        self.scales
            .patch_scale(&hpa.target, &with_replicas(&scale, state.desired))
            .await?;

        SCALE_OPERATIONS_TOTAL
            .with_label_values(&[hpa.target.kind.as_str(), direction.as_str()])
            .inc();
        info!(
            current = state.current,
            desired = state.desired,
            "{} was scaled {}->{}.",
            hpa.target,
            state.current,
            state.desired
        );
        Ok(Outcome::Scaled {
            direction,
            from: state.current,
            to: state.desired,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::fake::FakeCluster;
    use crate::error::Error;
    use crate::shutdown;

    const UP_WINDOW: Duration = Duration::from_secs(15);
    const DOWN_WINDOW: Duration = Duration::from_secs(15);

    fn evaluator(cluster: &FakeCluster, shutdown: Shutdown) -> Evaluator<FakeCluster, FakeCluster> {
        Evaluator::new(cluster.clone(), cluster.clone(), Duration::from_secs(1), shutdown)
    }

    #[test]
    fn test_intent_classification() {
        let state = |current, desired| ScaleState { current, desired };

        assert_eq!(state(0, 1).intent(), Some(Direction::Up));
        assert_eq!(state(3, 0).intent(), Some(Direction::Down));
        assert_eq!(state(1, 0).intent(), Some(Direction::Down));
        assert_eq!(state(0, 0).intent(), None);
        assert_eq!(state(1, 1).intent(), None);
        // Above one replica is the HPA's business.
        assert_eq!(state(3, 1).intent(), None);
        // Negative metric values never trigger anything.
        assert_eq!(state(0, -1).intent(), None);
        assert_eq!(state(2, -1).intent(), None);
    }

    #[test]
    fn test_settled_compares_zero_ness_only() {
        let state = |current, desired| ScaleState { current, desired };
        assert!(state(3, 1).is_settled());
        assert!(state(0, 0).is_settled());
        assert!(!state(0, 1).is_settled());
        assert!(!state(2, 0).is_settled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_down_without_window() {
        let cluster = FakeCluster::new();
        let hpa = cluster.deployment("ns", "a", 1, 0, Duration::ZERO, Duration::ZERO);
        let (_trigger, shutdown) = shutdown::channel();

        let outcome = evaluator(&cluster, shutdown).evaluate(&hpa).await.unwrap();

        assert_eq!(
            outcome,
            Outcome::Scaled {
                direction: Direction::Down,
                from: 1,
                to: 0
            }
        );
        assert_eq!(cluster.replicas(&hpa.target), 0);
        // No polling: a single read to classify and a single read to apply.
        assert_eq!(cluster.metric_reads(&hpa.metric_path), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_up_without_window() {
        let cluster = FakeCluster::new();
        let hpa = cluster.deployment("ns", "a", 0, 10, Duration::ZERO, Duration::ZERO);
        let (_trigger, shutdown) = shutdown::channel();

        let outcome = evaluator(&cluster, shutdown).evaluate(&hpa).await.unwrap();

        assert!(matches!(outcome, Outcome::Scaled { direction: Direction::Up, from: 0, to: 1 }));
        assert_eq!(cluster.replicas(&hpa.target), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stable_hpa_is_never_patched() {
        let cluster = FakeCluster::new();
        let running = cluster.deployment("ns", "a", 3, 10, UP_WINDOW, DOWN_WINDOW);
        let idle = cluster.deployment("ns", "b", 0, 0, UP_WINDOW, DOWN_WINDOW);
        let negative = cluster.deployment("ns", "c", 2, -4, UP_WINDOW, DOWN_WINDOW);
        let (_trigger, shutdown) = shutdown::channel();
        let evaluator = evaluator(&cluster, shutdown);

        for hpa in [&running, &idle, &negative] {
            let outcome = evaluator.evaluate(hpa).await.unwrap();
            assert!(matches!(outcome, Outcome::Stable(_)), "{outcome:?}");
        }
        assert_eq!(cluster.patch_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scale_up_waits_for_window() {
        let cluster = FakeCluster::new();
        let hpa = cluster.deployment("ns", "a", 0, 10, UP_WINDOW, Duration::ZERO);
        let (_trigger, shutdown) = shutdown::channel();
        let start = Instant::now();

        let outcome = evaluator(&cluster, shutdown).evaluate(&hpa).await.unwrap();

        assert!(matches!(outcome, Outcome::Scaled { direction: Direction::Up, .. }));
        assert!(start.elapsed() >= UP_WINDOW);
        assert_eq!(cluster.replicas(&hpa.target), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_scale_down_is_canceled() {
        let cluster = FakeCluster::new();
        let hpa = cluster.deployment("ns", "a", 3, 0, UP_WINDOW, DOWN_WINDOW);
        // The metric comes back before the window elapses.
        cluster.set_metric_at(&hpa.metric_path, Duration::from_secs(5), 7);
        let (_trigger, shutdown) = shutdown::channel();

        let outcome = evaluator(&cluster, shutdown).evaluate(&hpa).await.unwrap();

        assert_eq!(outcome, Outcome::Canceled(Direction::Down));
        assert_eq!(cluster.replicas(&hpa.target), 3);
        assert_eq!(cluster.patch_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_tolerates_hpa_moving_above_one() {
        let cluster = FakeCluster::new();
        let hpa = cluster.deployment("ns", "a", 0, 10, UP_WINDOW, Duration::ZERO);
        // Something else (e.g. a manual scale) brings the target to 2 replicas.
        cluster.set_replicas_at(&hpa.target, Duration::from_secs(3), 2);
        let (_trigger, shutdown) = shutdown::channel();

        let outcome = evaluator(&cluster, shutdown).evaluate(&hpa).await.unwrap();

        assert_eq!(outcome, Outcome::Canceled(Direction::Up));
        assert_eq!(cluster.patch_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_window_waits_without_overflow() {
        let cluster = FakeCluster::new();
        let window = Duration::from_secs(u64::MAX);
        let hpa = cluster.deployment("ns", "a", 3, 0, Duration::ZERO, window);
        cluster.set_metric_at(&hpa.metric_path, Duration::from_secs(20), 2);
        let (_trigger, shutdown) = shutdown::channel();

        let outcome = evaluator(&cluster, shutdown).evaluate(&hpa).await.unwrap();

        assert_eq!(outcome, Outcome::Canceled(Direction::Down));
        assert_eq!(cluster.replicas(&hpa.target), 3);
        assert_eq!(cluster.patch_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_stabilization() {
        let cluster = FakeCluster::new();
        let hpa = cluster.deployment("ns", "a", 2, 0, Duration::ZERO, Duration::from_secs(300));
        let (trigger, shutdown) = shutdown::channel();
        let evaluator = evaluator(&cluster, shutdown);

        let task = tokio::spawn(async move { evaluator.evaluate(&hpa).await });
        sleep(Duration::from_secs(10)).await;
        trigger.trigger();

        assert_eq!(task.await.unwrap().unwrap(), Outcome::Interrupted);
        assert_eq!(cluster.patch_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_target_skips_before_reading_metric() {
        let cluster = FakeCluster::new();
        let hpa = cluster.deployment("ns", "a", 1, 0, Duration::ZERO, Duration::ZERO);
        cluster.delete_target(&hpa.target);
        let (_trigger, shutdown) = shutdown::channel();

        let err = evaluator(&cluster, shutdown).evaluate(&hpa).await.unwrap_err();

        assert!(matches!(err, Error::TargetNotFound { .. }));
        assert_eq!(cluster.metric_reads(&hpa.metric_path), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_metric_aborts_decision() {
        let cluster = FakeCluster::new();
        let hpa = cluster.deployment("ns", "a", 1, 0, Duration::ZERO, Duration::ZERO);
        cluster.make_metric_unavailable(&hpa.metric_path);
        let (_trigger, shutdown) = shutdown::channel();

        let err = evaluator(&cluster, shutdown).evaluate(&hpa).await.unwrap_err();

        assert!(matches!(err, Error::MetricUnavailable { .. }));
        assert!(!err.is_fatal());
        assert_eq!(cluster.replicas(&hpa.target), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_patch_failure_is_fatal() {
        let cluster = FakeCluster::new();
        let hpa = cluster.deployment("ns", "a", 1, 0, Duration::ZERO, Duration::ZERO);
        cluster.fail_patches_with(500);
        let (_trigger, shutdown) = shutdown::channel();

        let err = evaluator(&cluster, shutdown).evaluate(&hpa).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
