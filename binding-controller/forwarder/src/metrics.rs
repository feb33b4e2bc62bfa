use crate::tunnel::ForwardError;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct ForwarderMetrics {
    connections: Family<ConnLabels, Counter>,
    listeners: Gauge,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ConnLabels {
    result: &'static str,
}

// === impl ForwarderMetrics ===

impl ForwarderMetrics {
    pub fn register(reg: &mut Registry) -> Self {
        let connections = Family::default();
        reg.register(
            "connections",
            "Count of forwarded connections by outcome",
            connections.clone(),
        );

        let listeners = Gauge::default();
        reg.register(
            "listeners",
            "Number of ports with an active listener",
            listeners.clone(),
        );

        Self {
            connections,
            listeners,
        }
    }

    pub(crate) fn connection(&self, res: &Result<(), ForwardError>) {
        let result = match res {
            Ok(()) => "ok",
            Err(ForwardError::Handshake(_)) => "handshake_error",
            Err(ForwardError::Io(_)) => "io_error",
            Err(_) => "dial_error",
        };
        self.connections.get_or_create(&ConnLabels { result }).inc();
    }

    pub(crate) fn set_listeners(&self, n: usize) {
        self.listeners.set(n as i64);
    }
}
