/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/error.rs
*
* The controller's error taxonomy. Transient kinds (`HpaNotFound`,
* `TargetNotFound`, `MetricUnavailable`, `ResolutionRejected`) are handled
* where they occur and never leave the evaluation of a single HPA. Every other
* kind is fatal: it ends the task that produced it and, through `main`, the
* process.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::hpa::TargetKind;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("HPA {namespace}/{name} was not found")]
    HpaNotFound { namespace: String, name: String },

    #[error("{kind} {namespace}/{name} was not found")]
    TargetNotFound {
        kind: TargetKind,
        namespace: String,
        name: String,
    },

    #[error("Could not get custom metric at {path}: {reason}")]
    MetricUnavailable { path: String, reason: String },

    #[error("HPA {namespace}/{name} cannot be tracked: {reason}")]
    ResolutionRejected {
        namespace: String,
        name: String,
        reason: String,
    },

    #[error("Target kind {0} not supported")]
    UnsupportedTargetKind(String),

    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Whether this error must terminate the task that observed it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::UnsupportedTargetKind(_) | Error::KubeError(_))
    }

    /// The API server's "resource version too old" answer on a watch.
    pub fn is_gone(&self) -> bool {
        matches!(self, Error::KubeError(kube::Error::Api(e)) if e.code == 410)
    }
}

/// Returns the HTTP status code of a kube API error, if there is one.
pub fn api_status(err: &kube::Error) -> Option<u16> {
    match err {
        kube::Error::Api(ae) => Some(ae.code),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) fn api_error(code: u16) -> kube::Error {
    kube::Error::Api(kube::core::ErrorResponse {
        status: "Failure".to_string(),
        message: format!("synthetic {code}"),
        reason: String::new(),
        code,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        assert!(!Error::HpaNotFound {
            namespace: "ns".into(),
            name: "a".into()
        }
        .is_fatal());
        assert!(!Error::MetricUnavailable {
            path: "p".into(),
            reason: "503".into()
        }
        .is_fatal());
        assert!(Error::UnsupportedTargetKind("ReplicaSet".into()).is_fatal());
        assert!(Error::KubeError(api_error(500)).is_fatal());
    }

    #[test]
    fn test_gone_detection() {
        assert!(Error::KubeError(api_error(410)).is_gone());
        assert!(!Error::KubeError(api_error(404)).is_gone());
        assert_eq!(api_status(&api_error(403)), Some(403));
    }
}
