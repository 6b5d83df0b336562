#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod claim;
mod cluster;
mod quantity;

pub use self::{
    claim::{requested_bytes, storage_class_name},
    cluster::KubeCluster,
    quantity::{parse_bytes, QuantityError},
};
pub use k8s_openapi::{
    api::{
        core::v1::{PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec},
        storage::v1::StorageClass,
    },
    apimachinery::pkg::api::resource::Quantity,
};
pub use kube::{
    api::{Api, ObjectMeta, ResourceExt},
    Client, Resource,
};
