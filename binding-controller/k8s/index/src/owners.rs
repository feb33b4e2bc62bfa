use binding_controller_k8s_api::{BoundEndpoint, ResourceExt};
use parking_lot::RwLock;
use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
};

pub type SharedOwnerIndex = Arc<RwLock<OwnerIndex>>;

/// Maps each target namespace to the BoundEndpoints that project a Service
/// into it.
///
/// Services in a target namespace cannot carry owner references to a
/// BoundEndpoint in the operator namespace, so Namespace events are mapped
/// back to their BoundEndpoints through this index.
#[derive(Debug, Default)]
pub struct OwnerIndex {
    by_target: HashMap<String, BTreeSet<OwnerRef>>,
    targets: HashMap<OwnerRef, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerRef {
    pub namespace: String,
    pub name: String,
}

// === impl OwnerIndex ===

impl OwnerIndex {
    pub fn shared() -> SharedOwnerIndex {
        Arc::new(RwLock::new(Self::default()))
    }

    /// The BoundEndpoints whose target Service lives in `namespace`.
    pub fn owners_of(&self, namespace: &str) -> Vec<OwnerRef> {
        self.by_target
            .get(namespace)
            .map(|owners| owners.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn remove(&mut self, owner: &OwnerRef) {
        if let Some(target) = self.targets.remove(owner) {
            if let Some(owners) = self.by_target.get_mut(&target) {
                owners.remove(owner);
                if owners.is_empty() {
                    self.by_target.remove(&target);
                }
            }
        }
    }
}

impl kubert::index::IndexNamespacedResource<BoundEndpoint> for OwnerIndex {
    fn apply(&mut self, binding: BoundEndpoint) {
        let Some(namespace) = binding.namespace() else {
            return;
        };
        let owner = OwnerRef {
            namespace,
            name: binding.name_unchecked(),
        };
        let target = binding.spec.target.namespace;

        if self.targets.get(&owner) == Some(&target) {
            return;
        }
        self.remove(&owner);
        self.by_target
            .entry(target.clone())
            .or_default()
            .insert(owner.clone());
        self.targets.insert(owner, target);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.remove(&OwnerRef { namespace, name });
    }
}
