//! Narrow views of the cluster used by the poller and reconciler.

use binding_controller_k8s_api::{
    self as k8s, Api, BoundEndpoint, Client, DeleteParams, ListParams, Patch, PatchParams,
    PostParams, ResourceExt, Service,
};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} was modified concurrently")]
    Conflict(String),

    #[error("request for {name} failed: {source}")]
    Api {
        name: String,
        #[source]
        source: k8s::Error,
    },
}

/// CRUD access to the BoundEndpoints in the operator namespace.
#[async_trait::async_trait]
pub trait BindingStore: Send + Sync + 'static {
    async fn list(&self) -> Result<Vec<BoundEndpoint>, StoreError>;

    async fn get(&self, name: &str) -> Result<BoundEndpoint, StoreError>;

    /// Creates the record. Any status on `binding` is ignored.
    async fn create(&self, binding: &BoundEndpoint) -> Result<BoundEndpoint, StoreError>;

    /// Replaces the record's spec and metadata. Fails with
    /// [`StoreError::Conflict`] if `binding` is stale.
    async fn replace(&self, binding: &BoundEndpoint) -> Result<BoundEndpoint, StoreError>;

    /// Replaces the record's status. Fails with [`StoreError::Conflict`] if
    /// `binding` is stale.
    async fn replace_status(&self, binding: &BoundEndpoint) -> Result<BoundEndpoint, StoreError>;

    async fn delete(&self, name: &str) -> Result<(), StoreError>;
}

/// Cluster access needed to project a BoundEndpoint into Services.
#[async_trait::async_trait]
pub trait ServiceStore: Send + Sync + 'static {
    async fn namespace_exists(&self, namespace: &str) -> Result<bool, StoreError>;

    async fn get_service(&self, namespace: &str, name: &str)
        -> Result<Option<Service>, StoreError>;

    async fn create_service(&self, svc: &Service) -> Result<Service, StoreError>;

    async fn replace_service(&self, svc: &Service) -> Result<Service, StoreError>;

    /// Deletes the Service. Succeeds if it does not exist.
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    /// Fetches the freshest copy of the named BoundEndpoint.
    async fn get_binding(&self, namespace: &str, name: &str) -> Result<BoundEndpoint, StoreError>;

    /// Writes `binding`'s status, rejecting the write if it is stale.
    async fn update_binding_status(&self, binding: &BoundEndpoint) -> Result<(), StoreError>;

    /// Sets the finalizers on the named BoundEndpoint.
    async fn set_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct KubeBindingStore {
    api: Api<BoundEndpoint>,
}

#[derive(Clone)]
pub struct KubeServiceStore {
    client: Client,
    field_manager: String,
}

// === impl StoreError ===

impl StoreError {
    pub fn from_kube(name: impl ToString, source: k8s::Error) -> Self {
        let name = name.to_string();
        match &source {
            k8s::Error::Api(rsp) if rsp.code == 404 => Self::NotFound(name),
            k8s::Error::Api(rsp) if rsp.code == 409 && rsp.reason == "AlreadyExists" => {
                Self::AlreadyExists(name)
            }
            k8s::Error::Api(rsp) if rsp.code == 409 => Self::Conflict(name),
            _ => Self::Api { name, source },
        }
    }
}

// === impl KubeBindingStore ===

impl KubeBindingStore {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait::async_trait]
impl BindingStore for KubeBindingStore {
    async fn list(&self) -> Result<Vec<BoundEndpoint>, StoreError> {
        let list = self
            .api
            .list(&ListParams::default())
            .await
            .map_err(|e| StoreError::from_kube("boundendpoints", e))?;
        Ok(list.items)
    }

    async fn get(&self, name: &str) -> Result<BoundEndpoint, StoreError> {
        self.api
            .get(name)
            .await
            .map_err(|e| StoreError::from_kube(name, e))
    }

    async fn create(&self, binding: &BoundEndpoint) -> Result<BoundEndpoint, StoreError> {
        self.api
            .create(&PostParams::default(), binding)
            .await
            .map_err(|e| StoreError::from_kube(binding.name_any(), e))
    }

    async fn replace(&self, binding: &BoundEndpoint) -> Result<BoundEndpoint, StoreError> {
        let name = binding.name_any();
        self.api
            .replace(&name, &PostParams::default(), binding)
            .await
            .map_err(|e| StoreError::from_kube(name, e))
    }

    async fn replace_status(&self, binding: &BoundEndpoint) -> Result<BoundEndpoint, StoreError> {
        let name = binding.name_any();
        self.api
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(status_patch(binding)))
            .await
            .map_err(|e| StoreError::from_kube(name, e))
    }

    async fn delete(&self, name: &str) -> Result<(), StoreError> {
        match self.api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) => Err(StoreError::from_kube(name, e)),
        }
    }
}

/// Status fields that serialize to nothing when unset. A merge patch leaves
/// absent fields untouched on the server, so these are sent as explicit nulls.
const CLEARABLE_STATUS_FIELDS: [&str; 4] = [
    "hashedName",
    "endpointsSummary",
    "targetServiceRef",
    "upstreamServiceRef",
];

/// A merge patch replacing the status, pinned to the object's resource
/// version so that the API server rejects it if the object has changed.
pub(crate) fn status_patch(binding: &BoundEndpoint) -> serde_json::Value {
    let mut status = serde_json::json!(binding.status);
    if let Some(fields) = status.as_object_mut() {
        for field in CLEARABLE_STATUS_FIELDS {
            let value = fields.entry(field).or_insert(serde_json::Value::Null);
            if let Some(service_ref) = value.as_object_mut() {
                service_ref
                    .entry("namespace")
                    .or_insert(serde_json::Value::Null);
            }
        }
    }
    serde_json::json!({
        "metadata": {
            "resourceVersion": binding.resource_version(),
        },
        "status": status,
    })
}

// === impl KubeServiceStore ===

impl KubeServiceStore {
    pub fn new(client: Client, field_manager: impl ToString) -> Self {
        Self {
            client,
            field_manager: field_manager.to_string(),
        }
    }

    fn services(&self, namespace: &str) -> Api<Service> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn bindings(&self, namespace: &str) -> Api<BoundEndpoint> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl ServiceStore for KubeServiceStore {
    async fn namespace_exists(&self, namespace: &str) -> Result<bool, StoreError> {
        let api = Api::<k8s::Namespace>::all(self.client.clone());
        match api.get_opt(namespace).await {
            Ok(ns) => Ok(ns.is_some()),
            Err(e) => Err(StoreError::from_kube(namespace, e)),
        }
    }

    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Service>, StoreError> {
        self.services(namespace)
            .get_opt(name)
            .await
            .map_err(|e| StoreError::from_kube(format!("{namespace}/{name}"), e))
    }

    async fn create_service(&self, svc: &Service) -> Result<Service, StoreError> {
        let namespace = svc.namespace().unwrap_or_default();
        let params = PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };
        self.services(&namespace)
            .create(&params, svc)
            .await
            .map_err(|e| StoreError::from_kube(format!("{namespace}/{}", svc.name_any()), e))
    }

    async fn replace_service(&self, svc: &Service) -> Result<Service, StoreError> {
        let namespace = svc.namespace().unwrap_or_default();
        let name = svc.name_any();
        let params = PostParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };
        self.services(&namespace)
            .replace(&name, &params, svc)
            .await
            .map_err(|e| StoreError::from_kube(format!("{namespace}/{name}"), e))
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        match self
            .services(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if k8s::is_not_found(&e) => Ok(()),
            Err(e) => Err(StoreError::from_kube(format!("{namespace}/{name}"), e)),
        }
    }

    async fn get_binding(&self, namespace: &str, name: &str) -> Result<BoundEndpoint, StoreError> {
        self.bindings(namespace)
            .get(name)
            .await
            .map_err(|e| StoreError::from_kube(format!("{namespace}/{name}"), e))
    }

    async fn update_binding_status(&self, binding: &BoundEndpoint) -> Result<(), StoreError> {
        let namespace = binding.namespace().unwrap_or_default();
        let name = binding.name_any();
        let params = PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };
        self.bindings(&namespace)
            .patch_status(&name, &params, &Patch::Merge(status_patch(binding)))
            .await
            .map_err(|e| StoreError::from_kube(format!("{namespace}/{name}"), e))?;
        Ok(())
    }

    async fn set_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<(), StoreError> {
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers,
            }
        });
        let params = PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };
        self.bindings(namespace)
            .patch(name, &params, &Patch::Merge(&patch))
            .await
            .map_err(|e| StoreError::from_kube(format!("{namespace}/{name}"), e))?;
        Ok(())
    }
}
