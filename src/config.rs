/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/config.rs
 * Runtime configuration shared by the discovery watcher and the
 * reconciliation loop. It is built once from the command line and never
 * mutated afterwards.
 * SPDX-License-Identifier: Apache-2.0 */

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Annotation carrying the JSON-encoded metric specs of an `autoscaling/v1` HPA.
pub const METRICS_ANNOTATION: &str = "autoscaling.alpha.kubernetes.io/metrics";

/// Period between two re-reads while a stabilization window is pending.
pub const STABILIZATION_CHECK_INTERVAL: Duration = Duration::from_secs(1);

pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub hpa_namespace: String,
    /// `None` watches every HPA of the namespace.
    pub hpa_label_selector: Option<String>,
    pub scale_up_window: Duration,
    pub scale_down_window: Duration,
    pub sync_interval: Duration,
    pub stabilization_check_interval: Duration,
    pub metrics_addr: SocketAddr,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            hpa_namespace: "default".to_string(),
            hpa_label_selector: None,
            scale_up_window: Duration::ZERO,
            scale_down_window: Duration::ZERO,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            stabilization_check_interval: STABILIZATION_CHECK_INTERVAL,
            metrics_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9090)),
        }
    }
}
