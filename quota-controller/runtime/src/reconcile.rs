use crate::{
    core::{ClusterAccessor, Reconciler},
    metrics::ReconcileMetrics,
};
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Reconciles storage usage every `period` until the runtime begins shutting
/// down. The first pass runs one period after startup.
pub(crate) async fn run<A>(
    reconciler: Reconciler<A>,
    period: Duration,
    metrics: ReconcileMetrics,
    drain: drain::Watch,
) where
    A: ClusterAccessor + Send + Sync,
{
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let shutdown = drain.signaled();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => {
                debug!("Shutting down");
                return;
            }
            _ = interval.tick() => {}
        }

        match reconciler.reconcile().await {
            Ok(summary) => {
                metrics.completed(&summary);
                info!(
                    corrected = summary.corrected,
                    unchanged = summary.unchanged,
                    conflicted = summary.conflicted,
                    failed = summary.failed,
                    unmanaged = summary.unmanaged,
                    "Reconciled storage usage",
                );
            }
            Err(error) => {
                metrics.aborted();
                warn!(error = %format!("{error:#}"), "Reconciliation aborted");
            }
        }
    }
}
