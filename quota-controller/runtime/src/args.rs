use crate::{
    admission::Admission,
    core::{Engine, PersistFailure, Reconciler, RetryPolicy},
    k8s::KubeCluster,
    metrics::{AdmissionMetrics, ReconcileMetrics},
    reconcile,
};
use anyhow::{bail, Context, Result};
use clap::Parser;
use prometheus_client::registry::Registry;
use std::{num::NonZeroU32, sync::Arc};
use tokio::time::Duration;
use tracing::{info, info_span, Instrument};

const MAX_CONFLICT_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Parser)]
#[clap(
    name = "storage-quota-controller",
    about = "Enforces storage quotas on persistent volume claims"
)]
pub struct Args {
    #[clap(
        long,
        default_value = "storage_quota=info,warn",
        env = "STORAGE_QUOTA_CONTROLLER_LOG"
    )]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: kubert::ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// Disables the admission controller server and only runs the reconciler.
    #[clap(long)]
    admission_controller_disabled: bool,

    /// Seconds between passes that correct recorded usage against the
    /// volumes that exist.
    #[clap(long, default_value = "600")]
    reconcile_interval_secs: u64,

    /// The number of times a decision is attempted before giving up when its
    /// usage update keeps conflicting with other writers.
    #[clap(long, default_value = "10")]
    conflict_retry_limit: NonZeroU32,

    /// The delay before the first retry after a conflict. Doubles with each
    /// further retry, up to one second.
    #[clap(long, default_value = "10")]
    conflict_backoff_ms: u64,

    /// Denies claims whose usage update fails. By default such claims are
    /// admitted and the reconciler corrects the usage.
    #[clap(long)]
    deny_on_quota_write_failure: bool,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            admin,
            client,
            log_level,
            log_format,
            server,
            admission_controller_disabled,
            reconcile_interval_secs,
            conflict_retry_limit,
            conflict_backoff_ms,
            deny_on_quota_write_failure,
        } = self;

        if reconcile_interval_secs == 0 {
            bail!("--reconcile-interval-secs must be greater than zero");
        }
        let reconcile_interval = Duration::from_secs(reconcile_interval_secs);

        let retry = RetryPolicy {
            max_attempts: conflict_retry_limit,
            initial_backoff: Duration::from_millis(conflict_backoff_ms),
            max_backoff: MAX_CONFLICT_BACKOFF.max(Duration::from_millis(conflict_backoff_ms)),
        };
        let persist_failure = if deny_on_quota_write_failure {
            PersistFailure::Deny
        } else {
            PersistFailure::Admit
        };

        let server = if admission_controller_disabled {
            None
        } else {
            Some(server)
        };

        let mut prom = <Registry>::with_prefix("storage_quota");
        let admission_metrics =
            AdmissionMetrics::register(prom.sub_registry_with_prefix("admission"));
        let reconcile_metrics =
            ReconcileMetrics::register(prom.sub_registry_with_prefix("reconcile"));
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .with_optional_server(server)
            .build()
            .await
            .context("failed to initialize runtime")?;

        let cluster = KubeCluster::new(runtime.client());

        // Correct usage drift in the background until shutdown begins.
        tokio::spawn(
            reconcile::run(
                Reconciler::new(cluster.clone()),
                reconcile_interval,
                reconcile_metrics,
                runtime.shutdown_handle(),
            )
            .instrument(info_span!("reconciler")),
        );
        info!(
            interval = ?reconcile_interval,
            ?retry,
            ?persist_failure,
            "Storage quota controller started"
        );

        let engine = Arc::new(Engine::new(cluster, retry, persist_failure));
        let runtime =
            runtime.spawn_server(move || Admission::new(engine.clone(), admission_metrics.clone()));

        // Block the main thread on the shutdown signal. Once it fires, wait for the background tasks to
        // complete before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
