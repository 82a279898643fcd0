//! Accessors over PersistentVolumeClaim objects

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use lattice_common::quantity::parse_quantity;

const STORAGE: &str = "storage";

/// PVC conditions that mean a resize is still being processed
const RESIZE_CONDITIONS: &[&str] = &["Resizing", "FileSystemResizePending"];

/// Storage capacity the PVC is currently bound to, in bytes
pub fn bound_capacity(pvc: &PersistentVolumeClaim) -> Option<u128> {
    pvc.status
        .as_ref()?
        .capacity
        .as_ref()?
        .get(STORAGE)
        .and_then(|q| parse_quantity(&q.0).ok())
}

/// Storage the PVC spec requests, in bytes
pub fn requested_storage(pvc: &PersistentVolumeClaim) -> Option<u128> {
    pvc.spec
        .as_ref()?
        .resources
        .as_ref()?
        .requests
        .as_ref()?
        .get(STORAGE)
        .and_then(|q| parse_quantity(&q.0).ok())
}

/// Explicit storage class name, if the claim sets one
pub fn storage_class_name(pvc: &PersistentVolumeClaim) -> Option<&str> {
    pvc.spec
        .as_ref()?
        .storage_class_name
        .as_deref()
        .filter(|name| !name.is_empty())
}

/// True if a previous resize has not finished yet.
///
/// Covers the resize conditions the external resizer and kubelet set, the
/// allocated-resource status of newer clusters, and a spec request that is
/// still above the bound capacity.
pub fn is_resizing(pvc: &PersistentVolumeClaim) -> bool {
    let Some(status) = pvc.status.as_ref() else {
        return false;
    };

    let condition_pending = status.conditions.iter().flatten().any(|c| {
        RESIZE_CONDITIONS.contains(&c.type_.as_str()) && c.status == "True"
    });
    if condition_pending {
        return true;
    }

    let allocation_pending = status
        .allocated_resource_statuses
        .as_ref()
        .and_then(|statuses| statuses.get(STORAGE))
        .is_some_and(|s| !s.is_empty());
    if allocation_pending {
        return true;
    }

    matches!(
        (requested_storage(pvc), bound_capacity(pvc)),
        (Some(requested), Some(bound)) if requested > bound
    )
}

/// True if the claim is being deleted
pub fn is_terminating(pvc: &PersistentVolumeClaim) -> bool {
    pvc.metadata.deletion_timestamp.is_some()
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::{
        PersistentVolumeClaimCondition, PersistentVolumeClaimSpec, PersistentVolumeClaimStatus,
        VolumeResourceRequirements,
    };
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use kube::api::ObjectMeta;

    use super::*;

    /// Bound PVC requesting and holding `size`
    pub fn pvc(name: &str, size: &str, class: Option<&str>) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("db".to_string()),
                resource_version: Some("100".to_string()),
                labels: Some(BTreeMap::from([("app".to_string(), "postgres".to_string())])),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                storage_class_name: class.map(str::to_string),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        STORAGE.to_string(),
                        Quantity(size.to_string()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: Some(PersistentVolumeClaimStatus {
                phase: Some("Bound".to_string()),
                capacity: Some(BTreeMap::from([(
                    STORAGE.to_string(),
                    Quantity(size.to_string()),
                )])),
                ..Default::default()
            }),
        }
    }

    /// Set the requested size without changing the bound capacity
    pub fn with_request(mut pvc: PersistentVolumeClaim, size: &str) -> PersistentVolumeClaim {
        if let Some(resources) = pvc.spec.as_mut().and_then(|s| s.resources.as_mut()) {
            resources.requests = Some(BTreeMap::from([(
                STORAGE.to_string(),
                Quantity(size.to_string()),
            )]));
        }
        pvc
    }

    /// Add a status condition
    pub fn with_condition(mut pvc: PersistentVolumeClaim, type_: &str) -> PersistentVolumeClaim {
        if let Some(status) = pvc.status.as_mut() {
            status
                .conditions
                .get_or_insert_with(Vec::new)
                .push(PersistentVolumeClaimCondition {
                    type_: type_.to_string(),
                    status: "True".to_string(),
                    ..Default::default()
                });
        }
        pvc
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use lattice_common::quantity::GI;

    use super::testing::*;
    use super::*;

    #[test]
    fn reads_capacity_and_request() {
        let claim = pvc("data-0", "10Gi", Some("fast"));
        assert_eq!(bound_capacity(&claim), Some(10 * GI));
        assert_eq!(requested_storage(&claim), Some(10 * GI));
        assert_eq!(storage_class_name(&claim), Some("fast"));
        assert!(!is_resizing(&claim));
        assert!(!is_terminating(&claim));
    }

    #[test]
    fn unbound_claim_has_no_capacity() {
        let mut claim = pvc("data-0", "10Gi", None);
        claim.status = None;
        assert_eq!(bound_capacity(&claim), None);
        assert!(!is_resizing(&claim));
        assert_eq!(storage_class_name(&claim), None);
    }

    #[test]
    fn empty_class_name_counts_as_unset() {
        let claim = pvc("data-0", "10Gi", Some(""));
        assert_eq!(storage_class_name(&claim), None);
    }

    #[test]
    fn resize_conditions_mark_resizing() {
        let claim = with_condition(pvc("data-0", "10Gi", None), "Resizing");
        assert!(is_resizing(&claim));

        let claim = with_condition(pvc("data-0", "10Gi", None), "FileSystemResizePending");
        assert!(is_resizing(&claim));

        let claim = with_condition(pvc("data-0", "10Gi", None), "ModifyingVolume");
        assert!(!is_resizing(&claim));
    }

    #[test]
    fn pending_request_marks_resizing() {
        let claim = with_request(pvc("data-0", "10Gi", None), "12Gi");
        assert!(is_resizing(&claim));
    }

    #[test]
    fn allocated_resource_status_marks_resizing() {
        let mut claim = pvc("data-0", "10Gi", None);
        if let Some(status) = claim.status.as_mut() {
            status.allocated_resource_statuses = Some(BTreeMap::from([(
                "storage".to_string(),
                "ControllerResizeInProgress".to_string(),
            )]));
        }
        assert!(is_resizing(&claim));
    }
}
