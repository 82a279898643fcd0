//! Resolve a VolumeAutoscaler target into the PVCs it governs

use std::time::Duration;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;
use tracing::debug;

use lattice_common::crd::VolumeTarget;

use crate::client::VolumeClient;
use crate::error::AutoscalerError;
use crate::pvc::is_terminating;

/// Resolve a target to its PVCs, sorted by name.
///
/// A named claim that does not exist is [`AutoscalerError::VolumeNotFound`].
/// A selector that matches nothing yields an empty list. Claims that are
/// being deleted are left out.
pub async fn resolve_target(
    client: &dyn VolumeClient,
    namespace: &str,
    target: &VolumeTarget,
    timeout: Duration,
) -> Result<Vec<PersistentVolumeClaim>, AutoscalerError> {
    let mut pvcs = match target {
        VolumeTarget::Named(name) => {
            let pvc = tokio::time::timeout(timeout, client.get_pvc(namespace, name))
                .await
                .map_err(|_| AutoscalerError::timeout("get PVC", timeout))??;
            match pvc {
                Some(pvc) => vec![pvc],
                None => {
                    return Err(AutoscalerError::VolumeNotFound {
                        namespace: namespace.to_string(),
                        name: name.clone(),
                    })
                }
            }
        }
        VolumeTarget::Selector(selector) => {
            let label_selector = selector.to_label_selector();
            tokio::time::timeout(timeout, client.list_pvcs(namespace, &label_selector))
                .await
                .map_err(|_| AutoscalerError::timeout("list PVCs", timeout))??
        }
    };

    pvcs.retain(|pvc| !is_terminating(pvc));
    pvcs.sort_by_key(|pvc| pvc.name_any());
    debug!(%target, count = pvcs.len(), "Resolved volume target");
    Ok(pvcs)
}
