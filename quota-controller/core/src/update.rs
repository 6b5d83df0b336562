use crate::{ClusterAccessor, QuotaRecord, StorageClassView, UpdateError};

/// Writes `record` over the quota annotations of `class`, conditioned on the
/// class not having changed since it was read.
///
/// On [`UpdateError::Conflict`] the caller must read the class again and
/// recompute `record` from the fresh state; reapplying a delta to a newer
/// base would bypass the quota check.
pub(crate) async fn commit<A>(
    accessor: &A,
    class: &StorageClassView,
    record: &QuotaRecord,
) -> Result<(), UpdateError>
where
    A: ClusterAccessor + ?Sized,
{
    let annotations = record.encode(&class.annotations);
    accessor
        .update_storage_class(&class.name, &class.resource_version, annotations)
        .await
}
