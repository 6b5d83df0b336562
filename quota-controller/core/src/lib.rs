#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod accessor;
mod claim;
mod engine;
mod reconcile;
mod record;
mod size;
mod update;

#[cfg(test)]
mod fake;

pub use self::{
    accessor::{ClusterAccessor, StorageClassView, UpdateError, Volume},
    claim::{ClaimOperation, ClaimRequest, Decision},
    engine::{Decided, DecisionError, Engine, PersistFailure, RetryPolicy},
    reconcile::{ReconcileSummary, Reconciler},
    record::{
        is_managed, DecodeError, QuotaRecord, QUOTA_ANNOTATION, USAGE_ANNOTATION,
        VERSION_ANNOTATION,
    },
    size::ByteSize,
};
