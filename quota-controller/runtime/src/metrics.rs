use crate::core::{Decision, ReconcileSummary};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug)]
pub struct AdmissionMetrics {
    decisions: Family<DecisionLabels, Counter>,
    conflicts: Counter,
}

#[derive(Clone, Debug)]
pub struct ReconcileMetrics {
    ticks: Family<TickLabels, Counter>,
    corrections: Counter,
    conflicts: Counter,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct DecisionLabels {
    operation: &'static str,
    result: &'static str,
}

#[derive(Clone, Hash, PartialEq, Eq, EncodeLabelSet, Debug)]
struct TickLabels {
    result: &'static str,
}

// === impl AdmissionMetrics ===

impl AdmissionMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let decisions = Family::<DecisionLabels, Counter>::default();
        reg.register(
            "decisions",
            "Total number of admission decisions by claim operation and result",
            decisions.clone(),
        );

        let conflicts = Counter::default();
        reg.register(
            "conflicts",
            "Total number of quota updates rejected because the storage class changed",
            conflicts.clone(),
        );

        Self {
            decisions,
            conflicts,
        }
    }

    pub(crate) fn decided(&self, operation: &'static str, decision: &Decision, conflicts: u32) {
        let result = match decision {
            Decision::Allow => "allow",
            Decision::Deny(_) => "deny",
            Decision::NoOpinion(_) => "no_opinion",
        };
        self.decisions
            .get_or_create(&DecisionLabels { operation, result })
            .inc();
        self.conflicts.inc_by(conflicts.into());
    }

    pub(crate) fn failed(&self, operation: &'static str) {
        self.decisions
            .get_or_create(&DecisionLabels {
                operation,
                result: "error",
            })
            .inc();
    }

    #[cfg(test)]
    pub(crate) fn count(&self, operation: &'static str, result: &'static str) -> u64 {
        self.decisions
            .get_or_create(&DecisionLabels { operation, result })
            .get()
    }
}

// === impl ReconcileMetrics ===

impl ReconcileMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let ticks = Family::<TickLabels, Counter>::default();
        reg.register(
            "ticks",
            "Total number of reconciliation passes by result",
            ticks.clone(),
        );

        let corrections = Counter::default();
        reg.register(
            "corrections",
            "Total number of storage classes whose recorded usage was corrected",
            corrections.clone(),
        );

        let conflicts = Counter::default();
        reg.register(
            "conflicts",
            "Total number of corrections skipped because the storage class changed",
            conflicts.clone(),
        );

        Self {
            ticks,
            corrections,
            conflicts,
        }
    }

    pub(crate) fn completed(&self, summary: &ReconcileSummary) {
        self.ticks
            .get_or_create(&TickLabels { result: "ok" })
            .inc();
        self.corrections.inc_by(summary.corrected as u64);
        self.conflicts.inc_by(summary.conflicted as u64);
    }

    pub(crate) fn aborted(&self) {
        self.ticks
            .get_or_create(&TickLabels { result: "aborted" })
            .inc();
    }

    #[cfg(test)]
    pub(crate) fn ticks(&self, result: &'static str) -> u64 {
        self.ticks.get_or_create(&TickLabels { result }).get()
    }
}
