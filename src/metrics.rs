/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/metrics.rs
*
* This module defines and registers the Prometheus metrics that the
* controller exposes about itself: how many HPAs it tracks, how often it
* scaled, canceled a pending scale, or could not read a custom metric.
*
* Using `lazy_static`, the metrics are created only once and are shared by
* the discovery watcher, the reconciliation loop and the HTTP server.
*
* SPDX-License-Identifier: Apache-2.0
*/

use lazy_static::lazy_static;
use prometheus::{
    histogram_opts, opts, Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, Registry,
    TextEncoder,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;
use warp::Filter;

// --- Metric Definitions ---

lazy_static! {
    /// Current number of HPAs in the registry.
    pub static ref TRACKED_HPAS: IntGauge = IntGauge::with_opts(opts!(
        "hpa_scale_to_zero_tracked_hpas",
        "Current number of HPAs tracked by the controller."
    ))
    .expect("metric definition is valid");

    /// Applied scale patches, labeled by target kind and direction (up/down).
    pub static ref SCALE_OPERATIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        opts!(
            "hpa_scale_to_zero_scale_operations_total",
            "Total number of scale subresource patches issued."
        ),
        &["kind", "direction"]
    )
    .expect("metric definition is valid");

    /// Pending scale operations dropped during their stabilization window.
    pub static ref STABILIZATIONS_CANCELED_TOTAL: IntCounterVec = IntCounterVec::new(
        opts!(
            "hpa_scale_to_zero_stabilizations_canceled_total",
            "Total number of scale operations canceled by stabilization."
        ),
        &["direction"]
    )
    .expect("metric definition is valid");

    pub static ref METRIC_UNAVAILABLE_TOTAL: IntCounter = IntCounter::with_opts(opts!(
        "hpa_scale_to_zero_metric_unavailable_total",
        "Total number of evaluations abandoned because the custom metric was unavailable."
    ))
    .expect("metric definition is valid");

    pub static ref RESOLUTION_REJECTED_TOTAL: IntCounter = IntCounter::with_opts(opts!(
        "hpa_scale_to_zero_resolution_rejected_total",
        "Total number of HPA observations whose metric annotation is not supported."
    ))
    .expect("metric definition is valid");

    /// Reopenings of the HPA watch stream, labeled by reason (gone/expired).
    pub static ref WATCH_RESTARTS_TOTAL: IntCounterVec = IntCounterVec::new(
        opts!(
            "hpa_scale_to_zero_watch_restarts_total",
            "Total number of times the HPA watch stream was reopened."
        ),
        &["reason"]
    )
    .expect("metric definition is valid");

    /// Duration of one reconciliation pass, including stabilization waits.
    pub static ref SYNC_DURATION_SECONDS: Histogram = Histogram::with_opts(histogram_opts!(
        "hpa_scale_to_zero_sync_duration_seconds",
        "Duration of a reconciliation pass over all tracked HPAs.",
        vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]
    ))
    .expect("metric definition is valid");
}

/// Creates a new Prometheus registry and registers all controller metrics.
///
/// Intended to be called once at startup.
pub fn create_and_register_metrics() -> Result<Registry, prometheus::Error> {
    let r = Registry::new();
    r.register(Box::new(TRACKED_HPAS.clone()))?;
    r.register(Box::new(SCALE_OPERATIONS_TOTAL.clone()))?;
    r.register(Box::new(STABILIZATIONS_CANCELED_TOTAL.clone()))?;
    r.register(Box::new(METRIC_UNAVAILABLE_TOTAL.clone()))?;
    r.register(Box::new(RESOLUTION_REJECTED_TOTAL.clone()))?;
    r.register(Box::new(WATCH_RESTARTS_TOTAL.clone()))?;
    r.register(Box::new(SYNC_DURATION_SECONDS.clone()))?;
    Ok(r)
}

/// Renders the registry into the Prometheus text format.
pub fn render(registry: &Registry) -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = vec![];
    encoder.encode(&registry.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

async fn metrics_handler(registry: Arc<Registry>) -> Result<impl warp::Reply, warp::Rejection> {
    let (body, status) = match render(&registry) {
        Ok(body) => (body, warp::http::StatusCode::OK),
        Err(e) => (e.to_string(), warp::http::StatusCode::INTERNAL_SERVER_ERROR),
    };
    Ok(warp::reply::with_status(
        warp::reply::with_header(body, "Content-Type", TextEncoder::new().format_type()),
        status,
    ))
}

/// Runs the HTTP server exposing `/metrics` until `shutdown` resolves.
pub async fn run_metrics_server(
    registry: Arc<Registry>,
    addr: SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), warp::Error> {
    let metrics_route = warp::path("metrics")
        .and(warp::get())
        .and(warp::any().map(move || Arc::clone(&registry)))
        .and_then(metrics_handler);

    let (addr, server) = warp::serve(metrics_route).try_bind_with_graceful_shutdown(addr, shutdown)?;
    info!(%addr, "Metrics server listening");
    server.await;
    Ok(())
}
