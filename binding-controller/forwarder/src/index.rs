//! Keeps one listener open for every allowed BoundEndpoint with an allocated
//! port.

use crate::{
    listener::ListenerSet,
    metrics::ForwarderMetrics,
    tunnel::{Dial, TunnelHandler},
};
use binding_controller_k8s_api::{BoundEndpoint, ResourceExt};
use std::{collections::HashMap, sync::Arc};

pub type SharedIndex<D> = Arc<parking_lot::RwLock<Index<D>>>;

pub struct Index<D> {
    listeners: ListenerSet,
    dialer: Arc<D>,
    metrics: ForwarderMetrics,

    /// The port each binding is currently served on.
    ports: HashMap<BindingId, u16>,

    /// The binding each open port currently serves. A port freed by a
    /// terminating binding may be handed to another before the first is
    /// released, so the latest apply wins.
    owners: HashMap<u16, BindingId>,
}

type BindingId = (String, String);

// === impl Index ===

impl<D: Dial> Index<D> {
    pub fn shared(listeners: ListenerSet, dialer: Arc<D>, metrics: ForwarderMetrics) -> SharedIndex<D> {
        Arc::new(parking_lot::RwLock::new(Self {
            listeners,
            dialer,
            metrics,
            ports: HashMap::new(),
            owners: HashMap::new(),
        }))
    }

    pub fn port(&self, namespace: &str, name: &str) -> Option<u16> {
        self.ports
            .get(&(namespace.to_string(), name.to_string()))
            .copied()
    }

    /// Stops serving `id`. The port is closed only if `id` still owns it.
    fn release(&mut self, id: &BindingId) {
        let Some(port) = self.ports.remove(id) else {
            return;
        };
        if self.owners.get(&port) == Some(id) {
            self.owners.remove(&port);
            self.listeners.close(port);
        }
    }

    fn update_metrics(&self) {
        self.metrics.set_listeners(self.owners.len());
    }
}

impl<D: Dial> kubert::index::IndexNamespacedResource<BoundEndpoint> for Index<D> {
    fn apply(&mut self, binding: BoundEndpoint) {
        let Some(namespace) = binding.namespace() else {
            return;
        };
        let name = binding.name_unchecked();
        let id = (namespace, name);

        let port = match binding.local_port() {
            Some(port) if binding.spec.allowed && binding.metadata.deletion_timestamp.is_none() => {
                port
            }
            _ => {
                tracing::debug!(namespace = %id.0, name = %id.1, "Binding not servable");
                self.release(&id);
                self.update_metrics();
                return;
            }
        };
        let target = &binding.spec.target;
        let Ok(target_port) = u16::try_from(target.port) else {
            tracing::warn!(namespace = %id.0, name = %id.1, port = target.port, "Invalid target port");
            self.release(&id);
            self.update_metrics();
            return;
        };

        if self.ports.get(&id).is_some_and(|&current| current != port) {
            self.release(&id);
        }
        if let Some(previous) = self.owners.get(&port).filter(|owner| **owner != id).cloned() {
            tracing::info!(
                namespace = %id.0,
                name = %id.1,
                port,
                previous.namespace = %previous.0,
                previous.name = %previous.1,
                "Taking over port",
            );
            self.ports.remove(&previous);
        }

        // Listening on a port that is already served swaps in the new handler.
        let handler = TunnelHandler::new(
            self.dialer.clone(),
            format!("{}.{}", target.service, target.namespace),
            target_port,
            self.metrics.clone(),
        );
        match self.listeners.listen(port, Arc::new(handler)) {
            Ok(()) => {
                self.owners.insert(port, id.clone());
                self.ports.insert(id, port);
            }
            Err(error) => {
                tracing::warn!(namespace = %id.0, name = %id.1, port, %error, "Failed to listen");
            }
        }
        self.update_metrics();
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.release(&(namespace, name));
        self.update_metrics();
    }
}
