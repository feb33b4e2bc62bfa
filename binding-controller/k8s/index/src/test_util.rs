//! In-memory stand-ins for the cluster and the remote API.

use crate::store::{status_patch, BindingStore, ServiceStore, StoreError};
use binding_controller_core::{EndpointSource, RemoteEndpoint};
use binding_controller_k8s_api::{
    self as k8s, BoundEndpoint, ErrorResponse, ResourceExt, Service,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

pub const OPERATOR_NS: &str = "binding-system";

#[derive(Default)]
pub struct MemStore {
    state: Mutex<State>,
}

#[derive(Default)]
pub struct State {
    pub bindings: BTreeMap<String, BoundEndpoint>,
    pub services: BTreeMap<(String, String), Service>,
    pub namespaces: BTreeSet<String>,

    /// Names that exist but are omitted from `list`, as if created after the
    /// list was served.
    pub hidden: BTreeSet<String>,

    /// The number of upcoming creates that fail.
    pub fail_creates: usize,

    pub creates: usize,
    pub status_writes: usize,
    version: u64,
}

#[derive(Default)]
pub struct MemSource {
    endpoints: Mutex<Vec<RemoteEndpoint>>,
}

pub fn remote(id: &str, proto: &str, public_url: &str) -> RemoteEndpoint {
    RemoteEndpoint {
        id: id.to_string(),
        uri: format!("/endpoints/{id}"),
        proto: proto.to_string(),
        public_url: public_url.to_string(),
    }
}

pub fn api_error(code: u16) -> k8s::Error {
    k8s::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: "injected failure".to_string(),
        reason: "InternalError".to_string(),
        code,
    })
}

// === impl MemStore ===

impl MemStore {
    pub fn state(&self) -> parking_lot::MutexGuard<'_, State> {
        self.state.lock()
    }

    pub fn binding(&self, name: &str) -> Option<BoundEndpoint> {
        self.state.lock().bindings.get(name).cloned()
    }

    pub fn bindings(&self) -> Vec<BoundEndpoint> {
        self.state.lock().bindings.values().cloned().collect()
    }

    pub fn service(&self, namespace: &str, name: &str) -> Option<Service> {
        self.state
            .lock()
            .services
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Stores `binding` as though it had been created earlier.
    pub fn insert(&self, mut binding: BoundEndpoint) {
        let mut state = self.state.lock();
        binding.metadata.namespace = Some(OPERATOR_NS.to_string());
        binding.metadata.resource_version = Some(state.next_version());
        state.bindings.insert(binding.name_any(), binding);
    }

    pub fn insert_service(&self, mut svc: Service) {
        let mut state = self.state.lock();
        svc.metadata.resource_version = Some(state.next_version());
        let id = (svc.namespace().unwrap_or_default(), svc.name_any());
        state.services.insert(id, svc);
    }
}

impl State {
    fn next_version(&mut self) -> String {
        self.version += 1;
        self.version.to_string()
    }

    fn check_version(&self, name: &str, binding: &BoundEndpoint) -> Result<(), StoreError> {
        let current = self
            .bindings
            .get(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        if current.resource_version() != binding.resource_version() {
            return Err(StoreError::Conflict(name.to_string()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl BindingStore for MemStore {
    async fn list(&self) -> Result<Vec<BoundEndpoint>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .bindings
            .values()
            .filter(|b| !state.hidden.contains(&b.name_any()))
            .cloned()
            .collect())
    }

    async fn get(&self, name: &str) -> Result<BoundEndpoint, StoreError> {
        self.binding(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    async fn create(&self, binding: &BoundEndpoint) -> Result<BoundEndpoint, StoreError> {
        let mut state = self.state.lock();
        let name = binding.name_any();
        state.creates += 1;
        if state.bindings.contains_key(&name) {
            return Err(StoreError::AlreadyExists(name));
        }
        if state.fail_creates > 0 {
            state.fail_creates -= 1;
            return Err(StoreError::from_kube(name, api_error(500)));
        }

        let mut created = binding.clone();
        created.metadata.namespace = Some(OPERATOR_NS.to_string());
        created.metadata.resource_version = Some(state.next_version());
        created.status = None;
        state.bindings.insert(name, created.clone());
        Ok(created)
    }

    async fn replace(&self, binding: &BoundEndpoint) -> Result<BoundEndpoint, StoreError> {
        let mut state = self.state.lock();
        let name = binding.name_any();
        state.check_version(&name, binding)?;

        let version = state.next_version();
        let current = state
            .bindings
            .get_mut(&name)
            .ok_or_else(|| StoreError::NotFound(name.clone()))?;
        current.metadata.labels = binding.metadata.labels.clone();
        current.metadata.annotations = binding.metadata.annotations.clone();
        current.spec = binding.spec.clone();
        current.metadata.resource_version = Some(version);
        Ok(current.clone())
    }

    async fn replace_status(&self, binding: &BoundEndpoint) -> Result<BoundEndpoint, StoreError> {
        let mut state = self.state.lock();
        let name = binding.name_any();
        state.check_version(&name, binding)?;

        state.status_writes += 1;
        let version = state.next_version();
        let current = state
            .bindings
            .get_mut(&name)
            .ok_or_else(|| StoreError::NotFound(name.clone()))?;
        // Apply the same merge patch the API server would receive.
        let mut doc = serde_json::to_value(&*current).expect("binding must serialize");
        json_patch::merge(&mut doc, &status_patch(binding));
        *current = serde_json::from_value(doc).expect("patched binding must deserialize");
        current.metadata.resource_version = Some(version);
        Ok(current.clone())
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        match self.state.lock().bindings.remove(name) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(name.to_string())),
        }
    }
}

#[async_trait::async_trait]
impl ServiceStore for MemStore {
    async fn namespace_exists(&self, namespace: &str) -> Result<bool, StoreError> {
        Ok(self.state.lock().namespaces.contains(namespace))
    }

    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Service>, StoreError> {
        Ok(self.service(namespace, name))
    }

    async fn create_service(&self, svc: &Service) -> Result<Service, StoreError> {
        let mut state = self.state.lock();
        let namespace = svc.namespace().unwrap_or_default();
        let id = (namespace.clone(), svc.name_any());
        if !state.namespaces.contains(&namespace) {
            return Err(StoreError::from_kube(&namespace, api_error(404)));
        }
        if state.services.contains_key(&id) {
            return Err(StoreError::AlreadyExists(svc.name_any()));
        }
        let mut created = svc.clone();
        created.metadata.resource_version = Some(state.next_version());
        state.services.insert(id, created.clone());
        Ok(created)
    }

    async fn replace_service(&self, svc: &Service) -> Result<Service, StoreError> {
        let mut state = self.state.lock();
        let id = (svc.namespace().unwrap_or_default(), svc.name_any());
        let current = state
            .services
            .get(&id)
            .ok_or_else(|| StoreError::NotFound(svc.name_any()))?;
        if current.resource_version() != svc.resource_version() {
            return Err(StoreError::Conflict(svc.name_any()));
        }
        let mut replaced = svc.clone();
        replaced.metadata.resource_version = Some(state.next_version());
        state.services.insert(id, replaced.clone());
        Ok(replaced)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.state
            .lock()
            .services
            .remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn get_binding(&self, _: &str, name: &str) -> Result<BoundEndpoint, StoreError> {
        BindingStore::get(self, name).await
    }

    async fn update_binding_status(&self, binding: &BoundEndpoint) -> Result<(), StoreError> {
        self.replace_status(binding).await.map(|_| ())
    }

    async fn set_finalizers(
        &self,
        _: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let version = state.next_version();
        let current = state
            .bindings
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
        current.metadata.finalizers = Some(finalizers);
        current.metadata.resource_version = Some(version);
        Ok(())
    }
}

// === impl MemSource ===

impl MemSource {
    pub fn new(endpoints: Vec<RemoteEndpoint>) -> Self {
        Self {
            endpoints: Mutex::new(endpoints),
        }
    }

    pub fn set(&self, endpoints: Vec<RemoteEndpoint>) {
        *self.endpoints.lock() = endpoints;
    }
}

#[async_trait::async_trait]
impl EndpointSource for MemSource {
    async fn list_endpoints(&self) -> anyhow::Result<Vec<RemoteEndpoint>> {
        Ok(self.endpoints.lock().clone())
    }
}
