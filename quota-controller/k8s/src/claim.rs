use crate::{parse_bytes, PersistentVolumeClaimSpec, QuantityError};

const STORAGE: &str = "storage";

/// The storage class a claim is bound to, if it names one.
pub fn storage_class_name(spec: &PersistentVolumeClaimSpec) -> Option<&str> {
    spec.storage_class_name
        .as_deref()
        .filter(|name| !name.is_empty())
}

/// The number of bytes a claim requests. A claim without a storage request
/// requests nothing.
pub fn requested_bytes(spec: &PersistentVolumeClaimSpec) -> Result<i64, QuantityError> {
    spec.resources
        .as_ref()
        .and_then(|resources| resources.requests.as_ref())
        .and_then(|requests| requests.get(STORAGE))
        .map_or(Ok(0), parse_bytes)
}
