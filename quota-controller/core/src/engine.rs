use crate::{
    is_managed, update, ByteSize, ClaimOperation, ClaimRequest, ClusterAccessor, Decision,
    DecodeError, QuotaRecord, StorageClassView, UpdateError,
};
use std::{num::NonZeroU32, time::Duration};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Admits storage claims against the quota recorded on their storage class.
///
/// There is no in-process locking: concurrent decisions for the same class
/// are linearized by the conditional update on the class's resource version.
#[derive(Debug)]
pub struct Engine<A> {
    accessor: A,
    retry: RetryPolicy,
    persist_failure: PersistFailure,
}

/// Bounds how often a decision is recomputed after losing a write race.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: NonZeroU32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

/// What to do with an admitted claim when the usage update fails for a
/// reason other than a conflict.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PersistFailure {
    /// Keep the decision and leave the drift to the reconciler.
    #[default]
    Admit,
    Deny,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Decided {
    pub decision: Decision,

    /// The number of writes that were rejected as stale before the decision
    /// was reached.
    pub conflicts: u32,
}

#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("failed to read storage class {name}: {source}")]
    Read {
        name: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("invalid quota annotations on storage class {name}: {source}")]
    Decode {
        name: String,
        #[source]
        source: DecodeError,
    },

    #[error("quota update on storage class {name} conflicted {attempts} times")]
    ConflictExhausted { name: String, attempts: u32 },
}

enum Attempt {
    Decided(Decision),
    Conflict,
}

// === impl Engine ===

impl<A: ClusterAccessor + Send + Sync> Engine<A> {
    pub fn new(accessor: A, retry: RetryPolicy, persist_failure: PersistFailure) -> Self {
        Self {
            accessor,
            retry,
            persist_failure,
        }
    }

    pub async fn decide(&self, req: &ClaimRequest) -> Result<Decided, DecisionError> {
        let max_attempts = self.retry.max_attempts.get();
        for attempt in 1..=max_attempts {
            if let Attempt::Decided(decision) = self.attempt(req).await? {
                return Ok(Decided {
                    decision,
                    conflicts: attempt - 1,
                });
            }

            debug!(class = %req.storage_class, attempt, "Quota update conflicted");
            if attempt < max_attempts {
                let backoff = self.retry.backoff(attempt);
                if !backoff.is_zero() {
                    tokio::time::sleep(backoff).await;
                }
            }
        }

        Err(DecisionError::ConflictExhausted {
            name: req.storage_class.clone(),
            attempts: max_attempts,
        })
    }

    /// Reads the class and decides against that snapshot. Every attempt starts
    /// over from a fresh read.
    async fn attempt(&self, req: &ClaimRequest) -> Result<Attempt, DecisionError> {
        let name = &req.storage_class;
        let class = self
            .accessor
            .get_storage_class(name)
            .await
            .map_err(|source| DecisionError::Read {
                name: name.clone(),
                source,
            })?;

        let class = match class {
            Some(class) => class,
            None if matches!(req.operation, ClaimOperation::Delete { .. }) => {
                debug!(%name, "Storage class not found; nothing to release");
                return Ok(Attempt::Decided(Decision::Allow));
            }
            None => {
                return Ok(Attempt::Decided(Decision::Deny(format!(
                    "storage class {name} not found"
                ))))
            }
        };

        if !is_managed(&class.annotations) {
            debug!(%name, "Storage class has no quota");
            return Ok(Attempt::Decided(Decision::Allow));
        }

        let record =
            QuotaRecord::decode(&class.annotations).map_err(|source| DecisionError::Decode {
                name: name.clone(),
                source,
            })?;

        let usage_bytes = match req.operation {
            ClaimOperation::Create { bytes } => {
                let projected = record.usage_bytes.saturating_add(bytes);
                if projected > record.quota_bytes {
                    return Ok(Attempt::Decided(exceeded(name, bytes, &record)));
                }
                projected
            }

            ClaimOperation::Delete { bytes } => record.usage_bytes.saturating_sub(bytes),

            ClaimOperation::Update {
                old_bytes,
                new_bytes,
            } => {
                if !class.allow_volume_expansion {
                    info!(%name, "Storage class does not allow volume expansion");
                    return Ok(Attempt::Decided(Decision::Deny(format!(
                        "storage class {name} does not allow volume expansion"
                    ))));
                }

                // Shrinking is left to the reconciler.
                if new_bytes <= old_bytes {
                    return Ok(Attempt::Decided(Decision::Allow));
                }

                let added = new_bytes - old_bytes;
                let projected = record.usage_bytes.saturating_add(added);
                if projected > record.quota_bytes {
                    return Ok(Attempt::Decided(exceeded(name, added, &record)));
                }
                projected
            }
        };

        self.persist(&class, record.advance(usage_bytes)).await
    }

    async fn persist(
        &self,
        class: &StorageClassView,
        record: QuotaRecord,
    ) -> Result<Attempt, DecisionError> {
        let name = &class.name;
        match update::commit(&self.accessor, class, &record).await {
            Ok(()) => {
                debug!(
                    %name,
                    quota = %ByteSize(record.quota_bytes),
                    usage = %ByteSize(record.usage_bytes),
                    version = record.version,
                    "Updated storage usage",
                );
                Ok(Attempt::Decided(Decision::Allow))
            }

            Err(UpdateError::Conflict(_)) => Ok(Attempt::Conflict),

            Err(UpdateError::Other(error)) => {
                warn!(%name, %error, "Failed to update storage usage");
                match self.persist_failure {
                    PersistFailure::Admit => Ok(Attempt::Decided(Decision::Allow)),
                    PersistFailure::Deny => Ok(Attempt::Decided(Decision::Deny(format!(
                        "failed to record storage usage on storage class {name}: {error}"
                    )))),
                }
            }
        }
    }
}

fn exceeded(name: &str, requested: i64, record: &QuotaRecord) -> Decision {
    let requested = ByteSize(requested);
    let usage = ByteSize(record.usage_bytes);
    let quota = ByteSize(record.quota_bytes);
    info!(%name, %requested, %usage, %quota, "Storage quota exceeded");
    Decision::Deny(format!(
        "storage class {name} quota exceeded: requested {requested} with {usage} of {quota} in use"
    ))
}

// === impl RetryPolicy ===

impl RetryPolicy {
    /// The delay before retrying after the given (1-based) attempt failed.
    /// Doubles with each attempt, capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1 << exp)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: NonZeroU32::new(10).expect("retry limit must be non-zero"),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_secs(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{class, FakeCluster};
    use pretty_assertions::assert_eq;

    const GIB: i64 = 1024 * 1024 * 1024;

    fn retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts: NonZeroU32::new(max_attempts).unwrap(),
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    fn engine(cluster: &FakeCluster) -> Engine<FakeCluster> {
        Engine::new(cluster.clone(), retry(10), PersistFailure::Admit)
    }

    fn record(quota_bytes: i64, usage_bytes: i64, version: u64) -> QuotaRecord {
        QuotaRecord {
            quota_bytes,
            usage_bytes,
            version,
        }
    }

    #[tokio::test]
    async fn create_over_quota_is_denied() {
        let cluster = FakeCluster::default();
        cluster.add_class(class("gold", record(100 * GIB, 90 * GIB, 1), true));

        let decided = engine(&cluster)
            .decide(&ClaimRequest::create("gold", 20 * GIB))
            .await
            .unwrap();

        assert_eq!(decided.decision.allowed(), Some(false));
        assert_eq!(cluster.record("gold"), record(100 * GIB, 90 * GIB, 1));
        assert_eq!(cluster.updates(), 0);
    }

    #[tokio::test]
    async fn create_within_quota_advances_usage() {
        let cluster = FakeCluster::default();
        cluster.add_class(class("gold", record(100 * GIB, 50 * GIB, 3), true));

        let decided = engine(&cluster)
            .decide(&ClaimRequest::create("gold", 10 * GIB))
            .await
            .unwrap();

        assert_eq!(
            decided,
            Decided {
                decision: Decision::Allow,
                conflicts: 0
            }
        );
        assert_eq!(cluster.record("gold"), record(100 * GIB, 60 * GIB, 4));
    }

    #[tokio::test]
    async fn create_filling_quota_exactly_is_allowed() {
        let cluster = FakeCluster::default();
        cluster.add_class(class("gold", record(100, 60, 0), true));

        let decided = engine(&cluster)
            .decide(&ClaimRequest::create("gold", 40))
            .await
            .unwrap();

        assert_eq!(decided.decision, Decision::Allow);
        assert_eq!(cluster.record("gold"), record(100, 100, 1));
    }

    #[tokio::test]
    async fn create_retries_after_concurrent_delete() {
        let cluster = FakeCluster::default();
        cluster.add_class(class("gold", record(100 * GIB, 50 * GIB, 3), true));

        // A delete of a 5Gi claim lands between the create's read and write.
        cluster.before_next_update(|state| {
            state.write_record("gold", record(100 * GIB, 45 * GIB, 4));
        });

        let decided = engine(&cluster)
            .decide(&ClaimRequest::create("gold", 10 * GIB))
            .await
            .unwrap();

        assert_eq!(
            decided,
            Decided {
                decision: Decision::Allow,
                conflicts: 1
            }
        );
        assert_eq!(cluster.record("gold"), record(100 * GIB, 55 * GIB, 5));
    }

    #[tokio::test]
    async fn retry_revalidates_quota() {
        let cluster = FakeCluster::default();
        cluster.add_class(class("gold", record(100, 50, 0), true));

        // Another create consumes most of the remaining quota first.
        cluster.before_next_update(|state| {
            state.write_record("gold", record(100, 95, 1));
        });

        let decided = engine(&cluster)
            .decide(&ClaimRequest::create("gold", 10))
            .await
            .unwrap();

        assert_eq!(decided.decision.allowed(), Some(false));
        assert_eq!(decided.conflicts, 1);
        assert_eq!(cluster.record("gold"), record(100, 95, 1));
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let cluster = FakeCluster::default();
        cluster.add_class(class("gold", record(100, 0, 0), true));
        cluster.conflict_always();

        let err = Engine::new(cluster.clone(), retry(3), PersistFailure::Admit)
            .decide(&ClaimRequest::create("gold", 10))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            DecisionError::ConflictExhausted { attempts: 3, .. }
        ));
        assert_eq!(cluster.record("gold"), record(100, 0, 0));
    }

    #[tokio::test]
    async fn delete_releases_usage() {
        let cluster = FakeCluster::default();
        cluster.add_class(class("gold", record(100 * GIB, 50 * GIB, 3), false));

        let decided = engine(&cluster)
            .decide(&ClaimRequest::delete("gold", 5 * GIB))
            .await
            .unwrap();

        assert_eq!(decided.decision, Decision::Allow);
        assert_eq!(cluster.record("gold"), record(100 * GIB, 45 * GIB, 4));
    }

    #[tokio::test]
    async fn delete_may_drive_usage_negative() {
        let cluster = FakeCluster::default();
        cluster.add_class(class("gold", record(100, 5, 0), true));

        let decided = engine(&cluster)
            .decide(&ClaimRequest::delete("gold", 10))
            .await
            .unwrap();

        assert_eq!(decided.decision, Decision::Allow);
        assert_eq!(cluster.record("gold"), record(100, -5, 1));
    }

    #[tokio::test]
    async fn delete_of_missing_class_is_allowed() {
        let cluster = FakeCluster::default();
        let decided = engine(&cluster)
            .decide(&ClaimRequest::delete("gone", 10))
            .await
            .unwrap();
        assert_eq!(decided.decision, Decision::Allow);
    }

    #[tokio::test]
    async fn create_in_missing_class_is_denied() {
        let cluster = FakeCluster::default();
        let decided = engine(&cluster)
            .decide(&ClaimRequest::create("gone", 10))
            .await
            .unwrap();
        assert_eq!(
            decided.decision,
            Decision::Deny("storage class gone not found".to_string())
        );
    }

    #[tokio::test]
    async fn update_without_expansion_is_denied() {
        let cluster = FakeCluster::default();
        cluster.add_class(class("silver", record(100 * GIB, 10 * GIB, 2), false));
        let engine = engine(&cluster);

        for (old, new) in [(GIB, 2 * GIB), (2 * GIB, GIB), (GIB, GIB)] {
            let decided = engine
                .decide(&ClaimRequest::update("silver", old, new))
                .await
                .unwrap();
            assert_eq!(
                decided.decision,
                Decision::Deny("storage class silver does not allow volume expansion".into())
            );
        }
        assert_eq!(cluster.record("silver"), record(100 * GIB, 10 * GIB, 2));
    }

    #[tokio::test]
    async fn update_expansion_charges_the_difference() {
        let cluster = FakeCluster::default();
        cluster.add_class(class("gold", record(100 * GIB, 10 * GIB, 2), true));

        let decided = engine(&cluster)
            .decide(&ClaimRequest::update("gold", GIB, 5 * GIB))
            .await
            .unwrap();

        assert_eq!(decided.decision, Decision::Allow);
        assert_eq!(cluster.record("gold"), record(100 * GIB, 14 * GIB, 3));
    }

    #[tokio::test]
    async fn update_expansion_over_quota_is_denied() {
        let cluster = FakeCluster::default();
        cluster.add_class(class("gold", record(100 * GIB, 95 * GIB, 2), true));

        let decided = engine(&cluster)
            .decide(&ClaimRequest::update("gold", GIB, 10 * GIB))
            .await
            .unwrap();

        assert_eq!(decided.decision.allowed(), Some(false));
        assert_eq!(cluster.record("gold"), record(100 * GIB, 95 * GIB, 2));
    }

    #[tokio::test]
    async fn update_shrink_does_not_touch_usage() {
        let cluster = FakeCluster::default();
        cluster.add_class(class("gold", record(100, 50, 2), true));

        let decided = engine(&cluster)
            .decide(&ClaimRequest::update("gold", 20, 10))
            .await
            .unwrap();

        assert_eq!(decided.decision, Decision::Allow);
        assert_eq!(cluster.updates(), 0);
    }

    #[tokio::test]
    async fn unmanaged_classes_are_allowed() {
        let cluster = FakeCluster::default();
        cluster.add_unmanaged_class("standard", false);

        let engine = engine(&cluster);
        for req in [
            ClaimRequest::create("standard", i64::MAX),
            ClaimRequest::update("standard", 1, 2),
            ClaimRequest::delete("standard", 1),
        ] {
            assert_eq!(engine.decide(&req).await.unwrap().decision, Decision::Allow);
        }
        assert_eq!(cluster.updates(), 0);
    }

    #[tokio::test]
    async fn malformed_annotations_fail_the_decision() {
        let cluster = FakeCluster::default();
        cluster.add_class(class("gold", record(100, 0, 0), true));
        cluster.set_annotation("gold", crate::USAGE_ANNOTATION, "garbage");

        let err = engine(&cluster)
            .decide(&ClaimRequest::create("gold", 1))
            .await
            .unwrap_err();

        assert!(matches!(err, DecisionError::Decode { .. }));
    }

    #[tokio::test]
    async fn read_failures_fail_the_decision() {
        let cluster = FakeCluster::default();
        cluster.add_class(class("gold", record(100, 0, 0), true));
        cluster.fail_reads();

        let err = engine(&cluster)
            .decide(&ClaimRequest::create("gold", 1))
            .await
            .unwrap_err();

        assert!(matches!(err, DecisionError::Read { .. }));
    }

    #[tokio::test]
    async fn write_failures_keep_the_decision_by_default() {
        let cluster = FakeCluster::default();
        cluster.add_class(class("gold", record(100, 0, 0), true));
        cluster.fail_writes();

        let decided = engine(&cluster)
            .decide(&ClaimRequest::create("gold", 10))
            .await
            .unwrap();

        assert_eq!(decided.decision, Decision::Allow);
        assert_eq!(cluster.record("gold"), record(100, 0, 0));
    }

    #[tokio::test]
    async fn write_failures_can_deny() {
        let cluster = FakeCluster::default();
        cluster.add_class(class("gold", record(100, 0, 0), true));
        cluster.fail_writes();

        let decided = Engine::new(cluster.clone(), retry(10), PersistFailure::Deny)
            .decide(&ClaimRequest::create("gold", 10))
            .await
            .unwrap();

        assert_eq!(decided.decision.allowed(), Some(false));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_decisions_are_linearized() {
        let cluster = FakeCluster::default().yielding();
        cluster.add_class(class("gold", record(i64::MAX, 1000, 7), true));
        let engine = std::sync::Arc::new(Engine::new(
            cluster.clone(),
            retry(1000),
            PersistFailure::Admit,
        ));

        let mut tasks = Vec::new();
        for i in 0..32 {
            let engine = engine.clone();
            tasks.push(tokio::spawn(async move {
                let req = if i % 4 == 0 {
                    ClaimRequest::delete("gold", 3)
                } else {
                    ClaimRequest::create("gold", 10)
                };
                engine.decide(&req).await
            }));
        }
        for task in tasks {
            let decided = task.await.unwrap().unwrap();
            assert_eq!(decided.decision, Decision::Allow);
        }

        // 24 creates of 10 bytes and 8 deletes of 3 bytes.
        assert_eq!(cluster.record("gold"), record(i64::MAX, 1000 + 240 - 24, 39));
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let policy = RetryPolicy {
            max_attempts: NonZeroU32::new(10).unwrap(),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(10));
        assert_eq!(policy.backoff(2), Duration::from_millis(20));
        assert_eq!(policy.backoff(3), Duration::from_millis(40));
        assert_eq!(policy.backoff(4), Duration::from_millis(50));
        assert_eq!(policy.backoff(40), Duration::from_millis(50));
    }
}
