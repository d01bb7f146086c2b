/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: src/main.rs
 *
 * Entry point of the kube-hpa-scale-to-zero controller. It runs next to the
 * native HorizontalPodAutoscaler, which cannot scale a workload to zero, and
 * moves HPA targets between zero and one replica according to a custom
 * metric.
 *
 * Architecture:
 * 1.  **Initialization**: flags are parsed, JSON logging is set up with
 *     `tracing`, and a Kubernetes client is created from the ambient
 *     configuration (in-cluster or kubeconfig).
 * 2.  **Tasks**: three tasks run concurrently and share the HPA registry:
 *     - the discovery watcher, the only writer of the registry;
 *     - the reconciliation loop, which evaluates every tracked HPA on each
 *       sync interval;
 *     - the HTTP server exposing the controller's own Prometheus metrics.
 * 3.  **Supervision**: a task ending with an error or a panic reports it to `main`,
 *     which triggers an orderly shutdown and exits with a non-zero status.
 *     SIGINT and SIGTERM trigger the same shutdown with a zero status.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use anyhow::{Context as _, Result};
use clap::Parser;
use kube::Client;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cli;
mod config;
mod error;
mod hpa;
mod metrics;
mod registry;
mod shutdown;
mod controllers {
    pub mod custom_metrics;
    pub mod discovery;
    pub mod reconciler;
    pub mod scale_target;
    pub mod stabilization;
    #[cfg(test)]
    pub mod fake;
}

use controllers::custom_metrics::KubeMetricsClient;
use controllers::discovery::{Discovery, KubeHpaClient};
use controllers::reconciler::Reconciler;
use controllers::scale_target::KubeScaleClient;
use controllers::stabilization::Evaluator;
use registry::HpaRegistry;

/// How long the tasks get to wind down once shutdown is triggered.
const SHUTDOWN_GRACE_PERIOD: Duration = Duration::from_secs(10);

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().json();

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .context("Failed to initialize logging")
}

/// Spawns `task` and forwards its error, if any, to `main` as fatal. A panic
/// inside the task is reported the same way.
fn spawn_supervised<F, E>(
    name: &'static str,
    fatal_tx: mpsc::Sender<anyhow::Error>,
    task: F,
) -> JoinHandle<()>
where
    F: Future<Output = std::result::Result<(), E>> + Send + 'static,
    E: Into<anyhow::Error> + Send + 'static,
{
    tokio::spawn(async move {
        let failure: anyhow::Error = match tokio::spawn(task).await {
            Ok(Ok(())) => {
                info!(task = name, "Task finished.");
                return;
            }
            Ok(Err(e)) => e.into(),
            Err(join_error) if join_error.is_panic() => anyhow::anyhow!("task panicked: {join_error}"),
            Err(join_error) => anyhow::anyhow!("task was cancelled: {join_error}"),
        };
        let failure = failure.context(format!("{name} task failed"));
        let message = format!("{failure:#}");
        error!(task = name, error = %message, "Fatal error, shutting down.");
        let _ = fatal_tx.send(failure).await;
    })
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("SIGINT received."),
        _ = terminate => info!("SIGTERM received."),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();
    init_tracing()?;

    let config = Arc::new(cli.into_config());
    info!(
        namespace = %config.hpa_namespace,
        label_selector = config.hpa_label_selector.as_deref().unwrap_or(""),
        scale_up_window_secs = config.scale_up_window.as_secs(),
        scale_down_window_secs = config.scale_down_window.as_secs(),
        sync_interval_secs = config.sync_interval.as_secs(),
        "kube-hpa-scale-to-zero starting..."
    );

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let prometheus = Arc::new(
        metrics::create_and_register_metrics().context("Failed to register metrics")?,
    );
    let registry = HpaRegistry::new();
    let (trigger, shutdown) = shutdown::channel();
    let (fatal_tx, mut fatal_rx) = mpsc::channel::<anyhow::Error>(4);

    let discovery = Discovery::new(
        KubeHpaClient::new(client.clone(), &config),
        registry.clone(),
        config.clone(),
    );
    let evaluator = Evaluator::new(
        KubeScaleClient::new(client.clone()),
        KubeMetricsClient::new(client),
        config.stabilization_check_interval,
        shutdown.clone(),
    );
    let reconciler = Reconciler::new(registry, evaluator, config.sync_interval);

    let handles = vec![
        spawn_supervised("discovery", fatal_tx.clone(), {
            let shutdown = shutdown.clone();
            async move { discovery.run(shutdown).await }
        }),
        spawn_supervised("reconciliation", fatal_tx.clone(), async move {
            reconciler.run(shutdown).await
        }),
        spawn_supervised("metrics-server", fatal_tx, {
            let mut shutdown = trigger.subscribe();
            metrics::run_metrics_server(prometheus, config.metrics_addr, async move {
                shutdown.triggered().await
            })
        }),
    ];

    let fatal = tokio::select! {
        Some(e) = fatal_rx.recv() => Some(e),
        _ = shutdown_signal() => None,
    };

    info!("Shutting down...");
    trigger.trigger();
    if tokio::time::timeout(SHUTDOWN_GRACE_PERIOD, futures::future::join_all(handles))
        .await
        .is_err()
    {
        warn!(
            grace_period_secs = SHUTDOWN_GRACE_PERIOD.as_secs(),
            "Tasks did not stop in time, exiting anyway."
        );
    }

    match fatal {
        Some(e) => Err(e),
        None => {
            info!("kube-hpa-scale-to-zero stopped.");
            Ok(())
        }
    }
}
