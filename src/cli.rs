/* Copyright (C) 2025 Pedro Henrique / phkaiser13
 * File: src/cli.rs
 * This file defines the command-line interface of the controller using the
 * `clap` crate. Every flag can also be provided through the environment, which
 * is how the controller is usually configured inside its Deployment.
 * SPDX-License-Identifier: Apache-2.0 */

use crate::config::ControllerConfig;
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

/// Scales HPA targets to zero replicas when their custom metric is zero, and
/// back to one when it is not.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Namespace where the HPAs live.
    #[arg(long, env = "HPA_NAMESPACE", default_value = "default")]
    pub hpa_namespace: String,

    /// Label selector of the HPAs to watch, e.g. 'foo=bar,bar=foo'.
    /// Empty selects all.
    #[arg(long, env = "HPA_LABEL_SELECTOR", default_value = "")]
    pub hpa_label_selector: String,

    /// Seconds a scale-up from zero must persist before it is applied.
    #[arg(long, env = "SCALE_UP_STABILIZATION_WINDOW", default_value_t = 0)]
    pub scale_up_stabilization_window: u64,

    /// Seconds a scale-down to zero must persist before it is applied.
    #[arg(long, env = "SCALE_DOWN_STABILIZATION_WINDOW", default_value_t = 0)]
    pub scale_down_stabilization_window: u64,

    /// Seconds between two reconciliation passes.
    #[arg(
        long,
        env = "SYNC_INTERVAL",
        default_value_t = 10,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub sync_interval: u64,

    /// Address of the controller's own Prometheus endpoint.
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9090")]
    pub metrics_addr: SocketAddr,
}

impl Cli {
    /// Converts the parsed flags into the configuration seen by the controllers.
    pub fn into_config(self) -> ControllerConfig {
        ControllerConfig {
            hpa_namespace: self.hpa_namespace,
            hpa_label_selector: Some(self.hpa_label_selector).filter(|s| !s.trim().is_empty()),
            scale_up_window: Duration::from_secs(self.scale_up_stabilization_window),
            scale_down_window: Duration::from_secs(self.scale_down_stabilization_window),
            sync_interval: Duration::from_secs(self.sync_interval),
            metrics_addr: self.metrics_addr,
            ..ControllerConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Cli::try_parse_from(["kube_hpa_scale_to_zero"]).unwrap().into_config();

        assert_eq!(config.hpa_namespace, "default");
        assert_eq!(config.hpa_label_selector, None);
        assert_eq!(config.scale_up_window, Duration::ZERO);
        assert_eq!(config.scale_down_window, Duration::ZERO);
        assert_eq!(config.sync_interval, Duration::from_secs(10));
        assert_eq!(config.metrics_addr, "0.0.0.0:9090".parse().unwrap());
    }

    #[test]
    fn test_windows_and_selector() {
        let config = Cli::try_parse_from([
            "kube_hpa_scale_to_zero",
            "--hpa-namespace",
            "apps",
            "--hpa-label-selector",
            "scale-to-zero=true",
            "--scale-up-stabilization-window",
            "15",
            "--scale-down-stabilization-window",
            "300",
        ])
        .unwrap()
        .into_config();

        assert_eq!(config.hpa_namespace, "apps");
        assert_eq!(config.hpa_label_selector.as_deref(), Some("scale-to-zero=true"));
        assert_eq!(config.scale_up_window, Duration::from_secs(15));
        assert_eq!(config.scale_down_window, Duration::from_secs(300));
    }

    #[test]
    fn test_zero_sync_interval_is_rejected() {
        assert!(Cli::try_parse_from(["kube_hpa_scale_to_zero", "--sync-interval", "0"]).is_err());
    }
}
