//! VolumeAutoscaler error types

use std::time::Duration;

use crate::prometheus::MetricsError;

/// Errors surfaced by a reconciliation cycle
#[derive(Debug, thiserror::Error)]
pub enum AutoscalerError {
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("{0}")]
    Common(#[from] lattice_common::Error),

    #[error("misconfigured VolumeAutoscaler: {0}")]
    Misconfigured(String),

    #[error("PersistentVolumeClaim {namespace}/{name} not found")]
    VolumeNotFound { namespace: String, name: String },

    #[error("metrics query failed: {0}")]
    Metrics(#[from] MetricsError),

    #[error("{operation} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("reconciliation cancelled")]
    Cancelled,

    #[error("missing namespace on VolumeAutoscaler")]
    MissingNamespace,
}

impl AutoscalerError {
    /// Build a timeout error for the named operation
    pub fn timeout(operation: &'static str, timeout: Duration) -> Self {
        Self::Timeout { operation, timeout }
    }

    /// True if the error is an API-server 404 for the object being written
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Kube(e) => lattice_common::kube_utils::is_not_found(e),
            Self::Common(lattice_common::Error::Kube { source }) => {
                lattice_common::kube_utils::is_not_found(source)
            }
            _ => false,
        }
    }

    /// True if the error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Kube(e) => lattice_common::kube_utils::is_conflict(e),
            Self::Common(lattice_common::Error::Kube { source }) => {
                lattice_common::kube_utils::is_conflict(source)
            }
            _ => false,
        }
    }
}
