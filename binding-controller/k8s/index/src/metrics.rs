use binding_controller_core::PortAllocator;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct PollerMetrics {
    passes: Family<PassLabels, Counter>,
    ports_allocated: Gauge,
}

#[derive(Clone, Debug, Default)]
pub struct ReconcileMetrics {
    reconciles: Family<ReconcileLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct PassLabels {
    result: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ReconcileLabels {
    ready: &'static str,
}

// === impl PollerMetrics ===

impl PollerMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let passes = Family::default();
        reg.register(
            "poll_passes",
            "Count of reconciliation passes by result",
            passes.clone(),
        );

        let ports_allocated = Gauge::default();
        reg.register(
            "ports_allocated",
            "Number of local ports allocated to BoundEndpoints",
            ports_allocated.clone(),
        );

        Self {
            passes,
            ports_allocated,
        }
    }

    pub(crate) fn pass(&self, result: &'static str) {
        self.passes.get_or_create(&PassLabels { result }).inc();
    }

    pub(crate) fn allocated(&self, ports: &PortAllocator) {
        self.ports_allocated.set(ports.allocated() as i64);
    }
}

// === impl ReconcileMetrics ===

impl ReconcileMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let reconciles = Family::default();
        reg.register(
            "reconciles",
            "Count of BoundEndpoint reconciliations by resulting readiness",
            reconciles.clone(),
        );
        Self { reconciles }
    }

    pub(crate) fn reconciled(&self, ready: Option<bool>) {
        let ready = match ready {
            Some(true) => "true",
            Some(false) => "false",
            None => "unknown",
        };
        self.reconciles
            .get_or_create(&ReconcileLabels { ready })
            .inc();
    }
}
