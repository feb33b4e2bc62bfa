//! Labels used to tie Services back to the BoundEndpoint that owns them.
//!
//! A projected Service usually lives in a different namespace than its
//! BoundEndpoint, so owner references cannot be used. Instead, every owned
//! Service carries the owner's name and namespace as labels.

use std::collections::BTreeMap;

pub const OWNER_NAME: &str = "bindings.k8s.ngrok.com/endpoint-binding-name";
pub const OWNER_NAMESPACE: &str = "bindings.k8s.ngrok.com/endpoint-binding-namespace";

/// Selects the forwarder pods that terminate binding traffic.
pub const FORWARDER_COMPONENT: &str = "app.kubernetes.io/component";
pub const FORWARDER_COMPONENT_VALUE: &str = "bindings-forwarder";

pub type Map = BTreeMap<String, String>;

/// The labels stamped on every Service owned by the named BoundEndpoint.
pub fn owner(name: &str, namespace: &str) -> Map {
    [
        (OWNER_NAME.to_string(), name.to_string()),
        (OWNER_NAMESPACE.to_string(), namespace.to_string()),
    ]
    .into_iter()
    .collect()
}

/// Recovers the owning BoundEndpoint from a set of labels.
pub fn owner_of(labels: &Map) -> Option<(&str, &str)> {
    let name = labels.get(OWNER_NAME)?;
    let namespace = labels.get(OWNER_NAMESPACE)?;
    Some((name.as_str(), namespace.as_str()))
}

/// A label selector string matching all Services owned by any binding.
pub fn owned_selector() -> String {
    format!("{OWNER_NAME},{OWNER_NAMESPACE}")
}

pub fn forwarder_selector() -> Map {
    [(
        FORWARDER_COMPONENT.to_string(),
        FORWARDER_COMPONENT_VALUE.to_string(),
    )]
    .into_iter()
    .collect()
}
