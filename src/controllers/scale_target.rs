/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: src/controllers/scale_target.rs
 *
 * Access to the scale subresource of the workloads targeted by the tracked
 * HPAs. The kind of workload is a closed set (`TargetKind`): each variant is
 * bound here to its typed `Api`, so supporting a new kind is a compile-checked
 * change of this file.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use crate::error::{Error, Result};
use crate::hpa::{ScaleTarget, TargetKind};
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::autoscaling::v1::Scale;
use kube::{
    api::{Api, Patch, PatchParams},
    Client,
};
use std::future::Future;

/// Read/patch access to a workload's scale subresource.
pub trait ScaleApi: Send + Sync {
    /// Reads the full scale object. Fails with `TargetNotFound` when the
    /// workload does not exist.
    fn read_scale(&self, target: &ScaleTarget) -> impl Future<Output = Result<Scale>> + Send;

    /// Writes back `scale` as read by `read_scale`, with only its desired
    /// replica count changed.
    fn patch_scale(
        &self,
        target: &ScaleTarget,
        scale: &Scale,
    ) -> impl Future<Output = Result<Scale>> + Send;
}

/// Replicas currently running according to the scale status.
pub fn current_replicas(scale: &Scale) -> i32 {
    scale.status.as_ref().map(|s| s.replicas).unwrap_or(0)
}

/// Returns a copy of `scale` asking for `replicas`, leaving every other field untouched.
pub fn with_replicas(scale: &Scale, replicas: i32) -> Scale {
    let mut scale = scale.clone();
    scale.spec.get_or_insert_with(Default::default).replicas = Some(replicas);
    scale
}

/// `ScaleApi` backed by the Kubernetes API server.
#[derive(Clone)]
pub struct KubeScaleClient {
    client: Client,
}

impl KubeScaleClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl ScaleApi for KubeScaleClient {
    async fn read_scale(&self, target: &ScaleTarget) -> Result<Scale> {
        let result = match target.kind {
            TargetKind::Deployment => {
                Api::<Deployment>::namespaced(self.client.clone(), &target.namespace)
                    .get_scale(&target.name)
                    .await
            }
            TargetKind::StatefulSet => {
                Api::<StatefulSet>::namespaced(self.client.clone(), &target.namespace)
                    .get_scale(&target.name)
                    .await
            }
        };
        result.map_err(|e| map_not_found(target, e))
    }

    async fn patch_scale(&self, target: &ScaleTarget, scale: &Scale) -> Result<Scale> {
        let params = PatchParams::default();
        let patch = Patch::Merge(scale);
        let result = match target.kind {
            TargetKind::Deployment => {
                Api::<Deployment>::namespaced(self.client.clone(), &target.namespace)
                    .patch_scale(&target.name, &params, &patch)
                    .await
            }
            TargetKind::StatefulSet => {
                Api::<StatefulSet>::namespaced(self.client.clone(), &target.namespace)
                    .patch_scale(&target.name, &params, &patch)
                    .await
            }
        };
        result.map_err(|e| map_not_found(target, e))
    }
}

fn map_not_found(target: &ScaleTarget, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => Error::TargetNotFound {
            kind: target.kind,
            namespace: target.namespace.clone(),
            name: target.name.clone(),
        },
        e => Error::KubeError(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::api_error;
    use k8s_openapi::api::autoscaling::v1::{ScaleSpec, ScaleStatus};
    use kube::api::ObjectMeta;

    fn scale(spec: i32, status: i32) -> Scale {
        Scale {
            metadata: ObjectMeta {
                name: Some("a".to_string()),
                namespace: Some("ns".to_string()),
                resource_version: Some("42".to_string()),
                ..Default::default()
            },
            spec: Some(ScaleSpec {
                replicas: Some(spec),
            }),
            status: Some(ScaleStatus {
                replicas: status,
                selector: Some("app=a".to_string()),
            }),
        }
    }

    #[test]
    fn test_with_replicas_only_changes_spec_replicas() {
        let original = scale(3, 3);
        let patched = with_replicas(&original, 0);

        assert_eq!(patched.spec.as_ref().unwrap().replicas, Some(0));
        assert_eq!(patched.metadata, original.metadata);
        assert_eq!(patched.status, original.status);
    }

    #[test]
    fn test_current_replicas_reads_status() {
        assert_eq!(current_replicas(&scale(1, 3)), 3);
        let mut no_status = scale(1, 1);
        no_status.status = None;
        assert_eq!(current_replicas(&no_status), 0);
    }

    #[test]
    fn test_not_found_is_transient() {
        let target = ScaleTarget {
            kind: TargetKind::StatefulSet,
            namespace: "ns".to_string(),
            name: "db".to_string(),
        };
        let err = map_not_found(&target, api_error(404));
        assert!(matches!(err, Error::TargetNotFound { kind: TargetKind::StatefulSet, .. }));
        assert!(!err.is_fatal());

        assert!(map_not_found(&target, api_error(500)).is_fatal());
    }
}
