//! Kubernetes operations the autoscaler needs, behind a mockable trait

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use lattice_common::crd::{VolumeAutoscaler, VolumeAutoscalerStatus};
use lattice_common::kube_utils::patch_resource_status;
use lattice_common::Error;

use crate::FIELD_MANAGER;

/// Annotation marking the cluster's default StorageClass
pub const DEFAULT_STORAGE_CLASS_ANNOTATION: &str = "storageclass.kubernetes.io/is-default-class";

/// Trait abstracting the Kubernetes calls made during a cycle
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VolumeClient: Send + Sync {
    /// Fetch a PVC, returning `None` if it does not exist
    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error>;

    /// List PVCs in a namespace matching a label selector string
    ///
    /// An empty selector lists every PVC in the namespace.
    async fn list_pvcs(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PersistentVolumeClaim>, Error>;

    /// Fetch a StorageClass, returning `None` if it does not exist
    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>, Error>;

    /// Find the StorageClass annotated as the cluster default
    async fn default_storage_class(&self) -> Result<Option<StorageClass>, Error>;

    /// Raise the PVC's storage request to `size`
    ///
    /// When `resource_version` is set the patch only applies if the claim is
    /// unchanged since it was read; otherwise the API server answers 409.
    async fn patch_pvc_storage(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        size: &str,
    ) -> Result<(), Error>;

    /// Replace the status of a VolumeAutoscaler
    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &VolumeAutoscalerStatus,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct KubeVolumeClient {
    client: Client,
}

impl KubeVolumeClient {
    /// Create a new KubeVolumeClient wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl VolumeClient for KubeVolumeClient {
    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_pvcs(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<PersistentVolumeClaim>, Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let mut params = ListParams::default();
        if !label_selector.is_empty() {
            params = params.labels(label_selector);
        }
        Ok(api.list(&params).await?.items)
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>, Error> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn default_storage_class(&self) -> Result<Option<StorageClass>, Error> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        let classes = api.list(&ListParams::default()).await?;
        Ok(classes.items.into_iter().find(is_default_class))
    }

    async fn patch_pvc_storage(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        size: &str,
    ) -> Result<(), Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let patch = storage_patch(resource_version.as_deref(), size);
        debug!(namespace, name, size, "Patching PVC storage request");
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn patch_status(
        &self,
        namespace: &str,
        name: &str,
        status: &VolumeAutoscalerStatus,
    ) -> Result<(), Error> {
        patch_resource_status::<VolumeAutoscaler>(
            &self.client,
            name,
            namespace,
            status,
            FIELD_MANAGER,
        )
        .await?;
        Ok(())
    }
}

/// Merge patch raising `spec.resources.requests.storage`
fn storage_patch(resource_version: Option<&str>, size: &str) -> serde_json::Value {
    let mut patch = serde_json::json!({
        "spec": {
            "resources": {
                "requests": { "storage": size }
            }
        }
    });
    if let Some(rv) = resource_version {
        patch["metadata"] = serde_json::json!({ "resourceVersion": rv });
    }
    patch
}

/// True if the StorageClass carries the default-class annotation
pub fn is_default_class(class: &StorageClass) -> bool {
    class
        .metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(DEFAULT_STORAGE_CLASS_ANNOTATION))
        .is_some_and(|v| v == "true")
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use kube::api::ObjectMeta;

    use super::*;

    #[test]
    fn storage_patch_carries_resource_version() {
        let patch = storage_patch(Some("42"), "12Gi");
        assert_eq!(patch["spec"]["resources"]["requests"]["storage"], "12Gi");
        assert_eq!(patch["metadata"]["resourceVersion"], "42");

        let patch = storage_patch(None, "12Gi");
        assert!(patch.get("metadata").is_none());
    }

    #[test]
    fn default_class_requires_true_annotation() {
        let mut class = StorageClass {
            metadata: ObjectMeta {
                name: Some("standard".into()),
                ..Default::default()
            },
            provisioner: "ebs.csi.aws.com".into(),
            ..Default::default()
        };
        assert!(!is_default_class(&class));

        class.metadata.annotations = Some(BTreeMap::from([(
            DEFAULT_STORAGE_CLASS_ANNOTATION.to_string(),
            "false".to_string(),
        )]));
        assert!(!is_default_class(&class));

        class.metadata.annotations = Some(BTreeMap::from([(
            DEFAULT_STORAGE_CLASS_ANNOTATION.to_string(),
            "true".to_string(),
        )]));
        assert!(is_default_class(&class));
    }
}
