use std::collections::BTreeMap;
use thiserror::Error;

/// The cluster state the quota controller reads and writes.
///
/// Writes are conditional: an update carries the resource version that was
/// observed when the storage class was read and must be rejected with
/// [`UpdateError::Conflict`] if the class has changed since.
#[async_trait::async_trait]
pub trait ClusterAccessor {
    async fn get_storage_class(&self, name: &str) -> anyhow::Result<Option<StorageClassView>>;

    async fn list_storage_classes(&self) -> anyhow::Result<Vec<StorageClassView>>;

    async fn update_storage_class(
        &self,
        name: &str,
        resource_version: &str,
        annotations: BTreeMap<String, String>,
    ) -> Result<(), UpdateError>;

    async fn list_volumes(&self) -> anyhow::Result<Vec<Volume>>;
}

/// The parts of a storage class that quota enforcement depends on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageClassView {
    pub name: String,
    pub annotations: BTreeMap<String, String>,
    pub allow_volume_expansion: bool,

    /// Opaque token identifying the revision of the class that was read.
    pub resource_version: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Volume {
    pub storage_class_name: Option<String>,
    pub capacity_bytes: i64,
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("storage class {0} was modified concurrently")]
    Conflict(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
