/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: src/controllers/discovery.rs
 *
 * Keeps the HPA registry in sync with the cluster.
 *
 * Architecture:
 * - A watch stream is opened on the HPAs of the configured namespace,
 *   optionally filtered by label selector. It starts at resource version "0",
 *   so every existing HPA is replayed as an ADDED event first.
 * - For every event, the HPA is read again by name rather than trusting the
 *   event payload. A found HPA is resolved and upserted; an HPA that is gone
 *   is forgotten; an HPA whose metric annotation is not supported is never
 *   admitted (and dropped if it was tracked before).
 * - When the server closes the stream, it is reopened from the last resource
 *   version seen. When the server answers "410 Gone", the resume point has
 *   expired and the stream is reopened from scratch. Every other error is
 *   fatal and ends the task; the controller is expected to be restarted by its
 *   supervisor.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::hpa::{namespaced_name, TrackedHpa};
use crate::metrics::{RESOLUTION_REJECTED_TOTAL, WATCH_RESTARTS_TOTAL};
use crate::registry::HpaRegistry;
use crate::shutdown::Shutdown;
use futures::stream::{BoxStream, StreamExt};
use k8s_openapi::api::autoscaling::v1::HorizontalPodAutoscaler;
use kube::{
    api::{Api, WatchEvent, WatchParams},
    Client, ResourceExt,
};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// Resource version asking the server to replay the current state first.
const REPLAY_RESOURCE_VERSION: &str = "0";

pub type HpaEventStream =
    BoxStream<'static, std::result::Result<WatchEvent<HorizontalPodAutoscaler>, kube::Error>>;

/// Read and watch access to HorizontalPodAutoscalers.
pub trait HpaApi: Send + Sync {
    /// Reads one HPA. Fails with `HpaNotFound` when it does not exist.
    fn get_hpa(
        &self,
        namespace: &str,
        name: &str,
    ) -> impl Future<Output = Result<HorizontalPodAutoscaler>> + Send;

    /// Opens a change-event stream on the watched HPAs, starting after
    /// `resource_version`.
    fn watch_hpas(&self, resource_version: &str) -> impl Future<Output = Result<HpaEventStream>> + Send;
}

/// `HpaApi` backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeHpaClient {
    client: Client,
    watched: Api<HorizontalPodAutoscaler>,
    params: WatchParams,
}

impl KubeHpaClient {
    pub fn new(client: Client, config: &ControllerConfig) -> Self {
        let mut params = WatchParams::default();
        if let Some(selector) = &config.hpa_label_selector {
            params = params.labels(selector);
        }
        Self {
            watched: Api::namespaced(client.clone(), &config.hpa_namespace),
            client,
            params,
        }
    }
}

impl HpaApi for KubeHpaClient {
    async fn get_hpa(&self, namespace: &str, name: &str) -> Result<HorizontalPodAutoscaler> {
        let api: Api<HorizontalPodAutoscaler> = Api::namespaced(self.client.clone(), namespace);
        match api.get(name).await {
            Ok(hpa) => Ok(hpa),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Err(Error::HpaNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
            Err(e) => Err(Error::KubeError(e)),
        }
    }

    async fn watch_hpas(&self, resource_version: &str) -> Result<HpaEventStream> {
        let stream = self.watched.watch(&self.params, resource_version).await?;
        Ok(stream.boxed())
    }
}

/// The discovery task: the only writer of the registry.
pub struct Discovery<A> {
    api: A,
    registry: HpaRegistry,
    config: Arc<ControllerConfig>,
}

/// Why the current watch stream has to be replaced.
enum Reopen {
    /// The server closed the stream; resume from the last resource version.
    Expired,
    /// The resume point is too old; replay from scratch.
    Gone,
}

impl<A: HpaApi> Discovery<A> {
    pub fn new(api: A, registry: HpaRegistry, config: Arc<ControllerConfig>) -> Self {
        Self {
            api,
            registry,
            config,
        }
    }

    /// Watches HPAs until shutdown or a fatal error.
    pub async fn run(&self, mut shutdown: Shutdown) -> Result<()> {
        info!(
            namespace = %self.config.hpa_namespace,
            label_selector = self.config.hpa_label_selector.as_deref().unwrap_or(""),
            "Will watch HPAs"
        );
        let mut resource_version = REPLAY_RESOURCE_VERSION.to_string();

        loop {
            let reopen = tokio::select! {
                reopen = self.watch_once(&mut resource_version) => reopen?,
                _ = shutdown.triggered() => {
                    info!("Discovery stopped.");
                    return Ok(());
                }
            };

            match reopen {
                Reopen::Expired => {
                    debug!(%resource_version, "Watch stream ended, reopening");
                    WATCH_RESTARTS_TOTAL.with_label_values(&["expired"]).inc();
                }
                Reopen::Gone => {
                    info!("Watch resource version expired (410 Gone), reopening from scratch");
                    WATCH_RESTARTS_TOTAL.with_label_values(&["gone"]).inc();
                    resource_version = REPLAY_RESOURCE_VERSION.to_string();
                }
            }
        }
    }

    /// Consumes one watch stream until it has to be reopened.
    async fn watch_once(&self, resource_version: &mut String) -> Result<Reopen> {
        let mut stream = match self.api.watch_hpas(resource_version).await {
            Ok(stream) => stream,
            Err(e) if e.is_gone() => return Ok(Reopen::Gone),
            Err(e) => return Err(e),
        };

        while let Some(event) = stream.next().await {
            let hpa = match event {
                Ok(WatchEvent::Added(hpa))
                | Ok(WatchEvent::Modified(hpa))
                | Ok(WatchEvent::Deleted(hpa)) => hpa,
                Ok(WatchEvent::Bookmark(bookmark)) => {
                    *resource_version = bookmark.metadata.resource_version;
                    continue;
                }
                Ok(WatchEvent::Error(ae)) | Err(kube::Error::Api(ae)) if ae.code == 410 => {
                    return Ok(Reopen::Gone);
                }
                Ok(WatchEvent::Error(ae)) => return Err(Error::KubeError(kube::Error::Api(ae))),
                Err(e) => return Err(Error::KubeError(e)),
            };

            if let Some(version) = hpa.resource_version() {
                *resource_version = version;
            }
            let namespace = hpa
                .namespace()
                .unwrap_or_else(|| self.config.hpa_namespace.clone());
            self.sync_hpa(&namespace, &hpa.name_any()).await?;
        }
        Ok(Reopen::Expired)
    }

    /// Brings the registry entry of `namespace/name` in line with the cluster.
    #[instrument(skip(self))]
    pub async fn sync_hpa(&self, namespace: &str, name: &str) -> Result<()> {
        let key = namespaced_name(namespace, name);

        let hpa = match self.api.get_hpa(namespace, name).await {
            Ok(hpa) => hpa,
            Err(Error::HpaNotFound { .. }) => {
                if self.registry.remove(&key).await.is_some() {
                    info!("HPA {} was not found, will forget about it.", key);
                }
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match TrackedHpa::resolve(&hpa, &self.config) {
            Ok(tracked) => {
                let target = tracked.target.to_string();
                let metric_path = tracked.metric_path.clone();
                match self.registry.put(tracked.clone()).await {
                    Some(previous) if previous == tracked => debug!("HPA {} unchanged", key),
                    _ => info!(%target, %metric_path, "Tracking HPA {}", key),
                }
                Ok(())
            }
            Err(e @ Error::ResolutionRejected { .. }) => {
                RESOLUTION_REJECTED_TOTAL.inc();
                error!(
                    error = %e,
                    "Only ONE custom Object metric without selector, describing a Service, is supported."
                );
                if self.registry.remove(&key).await.is_some() {
                    warn!("HPA {} is no longer tracked.", key);
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
