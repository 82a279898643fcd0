//! CRD installation
//!
//! The operator installs its own CRD on startup using server-side apply, so
//! the schema in the cluster always matches the running binary.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use lattice_common::crd::VolumeAutoscaler;
use lattice_volume_autoscaler::FIELD_MANAGER;

/// Name of the VolumeAutoscaler CRD object
pub const CRD_NAME: &str = "volumeautoscalers.lattice.dev";

/// Render the CRD as YAML
pub fn crd_yaml() -> anyhow::Result<String> {
    serde_yaml::to_string(&VolumeAutoscaler::crd())
        .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {}", e))
}

/// Ensure the VolumeAutoscaler CRD is installed and current
pub async fn ensure_crds(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    tracing::info!(crd = CRD_NAME, "Installing CRD...");
    crds.patch(CRD_NAME, &params, &Patch::Apply(&VolumeAutoscaler::crd()))
        .await
        .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", CRD_NAME, e))?;
    tracing::info!(crd = CRD_NAME, "CRD installed/updated");
    Ok(())
}
