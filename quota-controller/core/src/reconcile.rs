use crate::{is_managed, update, ByteSize, ClusterAccessor, QuotaRecord, UpdateError, Volume};
use ahash::AHashMap as HashMap;
use anyhow::{Context, Result};
use tracing::{debug, info, warn};

/// Corrects drift between each storage class's recorded usage and the
/// capacity of the volumes that actually exist in the class.
#[derive(Debug)]
pub struct Reconciler<A> {
    accessor: A,
}

/// Per-class outcomes of a single reconciliation pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub corrected: usize,
    pub unchanged: usize,

    /// Classes that changed after they were listed. They are left for the
    /// next pass.
    pub conflicted: usize,
    pub failed: usize,
    pub unmanaged: usize,
}

// === impl Reconciler ===

impl<A: ClusterAccessor + Send + Sync> Reconciler<A> {
    pub fn new(accessor: A) -> Self {
        Self { accessor }
    }

    /// Runs one reconciliation pass over every storage class.
    ///
    /// Fails only if cluster state cannot be listed. A class that cannot be
    /// decoded or written is counted as failed and the pass continues.
    pub async fn reconcile(&self) -> Result<ReconcileSummary> {
        let classes = self
            .accessor
            .list_storage_classes()
            .await
            .context("failed to list storage classes")?;
        let volumes = self
            .accessor
            .list_volumes()
            .await
            .context("failed to list persistent volumes")?;
        let allocated = allocated_by_class(&volumes);

        let mut summary = ReconcileSummary::default();
        for class in classes {
            let name = &class.name;
            if !is_managed(&class.annotations) {
                summary.unmanaged += 1;
                continue;
            }

            let record = match QuotaRecord::decode(&class.annotations) {
                Ok(record) => record,
                Err(error) => {
                    warn!(%name, %error, "Invalid quota annotations");
                    summary.failed += 1;
                    continue;
                }
            };

            let actual = allocated.get(name.as_str()).copied().unwrap_or(0);
            if actual == record.usage_bytes {
                debug!(%name, usage = %ByteSize(actual), "Storage usage is accurate");
                summary.unchanged += 1;
                continue;
            }

            match update::commit(&self.accessor, &class, &record.advance(actual)).await {
                Ok(()) => {
                    info!(
                        %name,
                        quota = %ByteSize(record.quota_bytes),
                        recorded = %ByteSize(record.usage_bytes),
                        actual = %ByteSize(actual),
                        "Corrected storage usage",
                    );
                    summary.corrected += 1;
                }
                Err(UpdateError::Conflict(_)) => {
                    debug!(%name, "Storage class changed during reconciliation; skipping");
                    summary.conflicted += 1;
                }
                Err(UpdateError::Other(error)) => {
                    warn!(%name, %error, "Failed to correct storage usage");
                    summary.failed += 1;
                }
            }
        }

        Ok(summary)
    }
}

/// Sums volume capacity by storage class name.
fn allocated_by_class(volumes: &[Volume]) -> HashMap<&str, i64> {
    let mut allocated = HashMap::new();
    for volume in volumes {
        if let Some(name) = volume.storage_class_name.as_deref() {
            let total = allocated.entry(name).or_insert(0i64);
            *total = total.saturating_add(volume.capacity_bytes);
        }
    }
    allocated
}
