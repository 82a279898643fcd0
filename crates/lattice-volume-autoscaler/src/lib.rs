//! VolumeAutoscaler reconciliation engine
//!
//! Watches `VolumeAutoscaler` resources and grows the PersistentVolumeClaims
//! they govern when kubelet volume statistics, read from Prometheus, show
//! usage at or above the policy threshold. Every expansion passes a fixed
//! sequence of safety checks first and is sized with exact integer math.
//!
//! Layout:
//! - [`controller`]: the per-policy cycle, context and error policy
//! - [`resolver`]: target resolution (one named PVC or a label selector)
//! - [`prometheus`]: instant queries and the per-URL client registry
//! - [`safety`]: resize, cooldown, max-size and storage-class gates
//! - [`sizing`]: new-size and usage arithmetic
//! - [`status`]: conditions, per-volume status entries and events
//! - [`client`]: the Kubernetes calls the cycle makes

pub mod client;
pub mod controller;
pub mod error;
pub mod prometheus;
pub mod pvc;
pub mod resolver;
pub mod safety;
pub mod sizing;
pub mod status;

pub use controller::{error_policy, reconcile, AutoscalerConfig, Context};
pub use error::AutoscalerError;

/// Field manager and event reporter name
pub const FIELD_MANAGER: &str = "lattice-volume-autoscaler";

/// Requeue delay after a failed status write
pub const STATUS_RETRY_SECS: u64 = 10;
