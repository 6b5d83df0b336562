#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use storage_quota_controller_core as core;
pub use storage_quota_controller_k8s as k8s;

mod admission;
mod args;
mod metrics;
mod reconcile;

pub use self::args::Args;
