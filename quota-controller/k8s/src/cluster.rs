use crate::{parse_bytes, Api, Client, PersistentVolume, ResourceExt, StorageClass};
use anyhow::{Context, Result};
use kube::api::{ListParams, Patch, PatchParams};
use std::collections::BTreeMap;
use storage_quota_controller_core::{ClusterAccessor, StorageClassView, UpdateError, Volume};
use tracing::debug;

const FIELD_MANAGER: &str = "storage-quota-controller";

/// Reads and writes quota state through the Kubernetes API.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

// === impl KubeCluster ===

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn storage_classes(&self) -> Api<StorageClass> {
        Api::all(self.client.clone())
    }
}

#[async_trait::async_trait]
impl ClusterAccessor for KubeCluster {
    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClassView>> {
        let class = self
            .storage_classes()
            .get_opt(name)
            .await
            .with_context(|| format!("failed to get storage class {name}"))?;
        Ok(class.map(view))
    }

    async fn list_storage_classes(&self) -> Result<Vec<StorageClassView>> {
        let list = self.storage_classes().list(&ListParams::default()).await?;
        Ok(list.items.into_iter().map(view).collect())
    }

    async fn update_storage_class(
        &self,
        name: &str,
        resource_version: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), UpdateError> {
        // The API server rejects the patch with a conflict if the class's
        // resource version no longer matches.
        let patch = serde_json::json!({
            "metadata": {
                "resourceVersion": resource_version,
                "annotations": annotations,
            }
        });
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        match self
            .storage_classes()
            .patch(name, &params, &Patch::Merge(&patch))
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(rsp)) if rsp.code == 409 => {
                debug!(%name, %resource_version, message = %rsp.message, "Stale storage class");
                Err(UpdateError::Conflict(name.to_string()))
            }
            Err(error) => Err(anyhow::Error::new(error)
                .context(format!("failed to patch storage class {name}"))
                .into()),
        }
    }

    async fn list_volumes(&self) -> Result<Vec<Volume>> {
        let api = Api::<PersistentVolume>::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;
        debug!(volumes = list.items.len(), "Listed persistent volumes");
        list.items.iter().map(volume).collect()
    }
}

fn view(class: StorageClass) -> StorageClassView {
    StorageClassView {
        name: class.name_any(),
        allow_volume_expansion: class.allow_volume_expansion.unwrap_or(false),
        resource_version: class.metadata.resource_version.unwrap_or_default(),
        annotations: class.metadata.annotations.unwrap_or_default(),
    }
}

fn volume(pv: &PersistentVolume) -> Result<Volume> {
    let spec = pv.spec.as_ref();
    let capacity_bytes = spec
        .and_then(|spec| spec.capacity.as_ref())
        .and_then(|capacity| capacity.get("storage"))
        .map_or(Ok(0), parse_bytes)
        .with_context(|| format!("invalid capacity on persistent volume {}", pv.name_any()))?;
    Ok(Volume {
        storage_class_name: spec
            .and_then(|spec| spec.storage_class_name.clone())
            .filter(|name| !name.is_empty()),
        capacity_bytes,
    })
}
