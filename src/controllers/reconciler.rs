/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: src/controllers/reconciler.rs
 *
 * The periodic driver of the controller. Every sync interval it takes a
 * snapshot of the registry and evaluates each tracked HPA in turn.
 *
 * HPAs are processed sequentially, each to completion, including any
 * stabilization wait. A long window on one HPA therefore delays the others
 * in the same pass; at the HPA counts this controller targets that delay is
 * acceptable, but it bounds how far a single instance scales.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use super::custom_metrics::MetricsApi;
use super::scale_target::ScaleApi;
use super::stabilization::{Evaluator, Outcome};
use crate::error::{Error, Result};
use crate::hpa::TrackedHpa;
use crate::metrics::{METRIC_UNAVAILABLE_TOTAL, SYNC_DURATION_SECONDS};
use crate::registry::HpaRegistry;
use crate::shutdown::Shutdown;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct Reconciler<S, M> {
    registry: HpaRegistry,
    evaluator: Evaluator<S, M>,
    sync_interval: Duration,
}

impl<S: ScaleApi, M: MetricsApi> Reconciler<S, M> {
    pub fn new(registry: HpaRegistry, evaluator: Evaluator<S, M>, sync_interval: Duration) -> Self {
        Self {
            registry,
            evaluator,
            sync_interval,
        }
    }

    /// Runs reconciliation passes until shutdown or a fatal error.
    pub async fn run(&self, mut shutdown: Shutdown) -> Result<()> {
        info!(sync_interval_secs = self.sync_interval.as_secs(), "Reconciliation loop started");
        loop {
            self.sync_all(&shutdown).await?;

            tokio::select! {
                _ = tokio::time::sleep(self.sync_interval) => {}
                _ = shutdown.triggered() => {
                    info!("Reconciliation loop stopped.");
                    return Ok(());
                }
            }
        }
    }

    /// One pass over a snapshot of the registry.
    pub async fn sync_all(&self, shutdown: &Shutdown) -> Result<()> {
        let _timer = SYNC_DURATION_SECONDS.start_timer();
        let snapshot = self.registry.snapshot().await;
        debug!(count = snapshot.len(), "Starting reconciliation pass");

        for hpa in &snapshot {
            if shutdown.is_triggered() {
                break;
            }
            self.sync_one(hpa).await?;
        }
        Ok(())
    }

    /// Evaluates one HPA, absorbing the failures that only concern this HPA
    /// for this pass.
    async fn sync_one(&self, hpa: &TrackedHpa) -> Result<()> {
        let err = match self.evaluator.evaluate(hpa).await {
            Ok(_) => return Ok(()),
            Err(e) => e,
        };

        if err.is_fatal() {
            error!(error = %err, hpa = %hpa.key(), "Fatal error while reconciling");
            return Err(err);
        }
        match &err {
            Error::MetricUnavailable { .. } => {
                METRIC_UNAVAILABLE_TOTAL.inc();
                error!(error = %err, "Will not update {}.", hpa.target);
            }
            _ => warn!(error = %err, hpa = %hpa.key(), "Skipping HPA for this pass"),
        }
        Ok(())
    }
}
