//! Kubernetes Event recording for Lattice controllers.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so that controllers can emit standard Kubernetes Events visible via
//! `kubectl describe` and `kubectl get events`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Trait for publishing Kubernetes Events.
///
/// Implementations are expected to be fire-and-forget: `publish()` logs a
/// warning on failure but never returns an error.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    ///
    /// # Arguments
    ///
    /// * `resource_ref` - The Kubernetes object this event is about
    /// * `type_` - Normal or Warning
    /// * `reason` - Machine-readable reason string (e.g. "Expanded")
    /// * `action` - What action was taken (e.g. "Expand")
    /// * `note` - Optional human-readable message
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher for the given controller name.
    ///
    /// The controller name appears as the "reportingComponent" on Events
    /// (e.g. "lattice-volume-autoscaler").
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// Well-known event reason strings.
///
/// These appear in `kubectl get events` under the REASON column.
pub mod reasons {
    /// PVC capacity request was raised
    pub const EXPANDED: &str = "Expanded";
    /// Patching the PVC capacity failed (conflict or rejection)
    pub const EXPAND_FAILED: &str = "ExpandFailed";
    /// Kubelet reports the volume as abnormal; expansion skipped
    pub const VOLUME_UNHEALTHY: &str = "VolumeUnhealthy";
    /// PVC is already at the policy maximum
    pub const MAX_SIZE_REACHED: &str = "MaxSizeReached";
    /// The PVC's StorageClass does not allow volume expansion
    pub const STORAGE_CLASS_NOT_EXPANDABLE: &str = "StorageClassNotExpandable";
    /// A previous resize is still being processed
    pub const RESIZE_IN_PROGRESS: &str = "ResizeInProgress";
    /// The PVC was expanded too recently
    pub const COOLDOWN_ACTIVE: &str = "CooldownActive";
    /// Inode usage crossed the advisory threshold
    pub const INODE_THRESHOLD_EXCEEDED: &str = "InodeThresholdExceeded";
    /// Target resolution returned no PVCs
    pub const NO_PVCS_FOUND: &str = "NoPVCsFound";
    /// At least one telemetry query failed this cycle
    pub const PROMETHEUS_UNAVAILABLE: &str = "PrometheusUnavailable";
    /// Spec validation failed
    pub const MISCONFIGURED: &str = "Misconfigured";
}

/// Well-known event action strings.
///
/// These appear in `kubectl get events` under the ACTION column.
pub mod actions {
    /// Standard reconciliation loop
    pub const RECONCILE: &str = "Reconcile";
    /// Expanding a volume
    pub const EXPAND: &str = "Expand";
    /// Evaluating whether a volume may be expanded
    pub const EVALUATE: &str = "Evaluate";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kube_publisher_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<KubeEventPublisher>();
    }

    #[test]
    fn reason_constants_are_pascal_case() {
        assert_eq!(reasons::EXPANDED, "Expanded");
        assert_eq!(reasons::MAX_SIZE_REACHED, "MaxSizeReached");
        assert_eq!(
            reasons::STORAGE_CLASS_NOT_EXPANDABLE,
            "StorageClassNotExpandable"
        );
    }

    #[test]
    fn action_constants_are_defined() {
        assert_eq!(actions::RECONCILE, "Reconcile");
        assert_eq!(actions::EXPAND, "Expand");
    }
}
