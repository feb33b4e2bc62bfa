//! The two Services projected for every allowed BoundEndpoint.
//!
//! ```text
//! <target.service>.<target.namespace>     ExternalName -> <name>.<operator-ns>.<cluster-domain>
//! <name>.<operator-ns>                    ClusterIP, selects forwarder pods, port -> localPort
//! ```

use binding_controller_k8s_api::{
    labels, BoundEndpoint, IntOrString, ObjectMeta, ResourceExt, Service, ServicePort,
    ServiceSpec,
};

/// The ExternalName Service in the target namespace.
///
/// It is named after the target service alone so that clients keep resolving
/// `<service>.<namespace>`. Bindings that share a service and namespace but
/// differ in scheme or port therefore claim the same Service; the first one
/// to create it owns it and the others report it as not owned.
pub fn target(binding: &BoundEndpoint, operator_ns: &str, cluster_domain: &str) -> Service {
    let name = binding.name_any();
    let target = &binding.spec.target;

    let mut svc_labels = target.metadata.labels.clone();
    svc_labels.extend(labels::owner(&name, operator_ns));

    Service {
        metadata: ObjectMeta {
            name: Some(target.service.clone()),
            namespace: Some(target.namespace.clone()),
            labels: Some(svc_labels),
            annotations: Some(target.metadata.annotations.clone()).filter(|a| !a.is_empty()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ExternalName".to_string()),
            external_name: Some(format!("{name}.{operator_ns}.{cluster_domain}")),
            ports: Some(vec![ServicePort {
                name: Some(binding.spec.scheme.to_string()),
                protocol: Some(target.protocol.clone()),
                port: target.port,
                target_port: Some(IntOrString::Int(target.port)),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The ClusterIP Service in the operator namespace that routes to the
/// forwarder's listener on the allocated port.
pub fn upstream(binding: &BoundEndpoint, operator_ns: &str, local_port: u16) -> Service {
    let name = binding.name_any();
    let target = &binding.spec.target;

    Service {
        metadata: ObjectMeta {
            name: Some(name.clone()),
            namespace: Some(operator_ns.to_string()),
            labels: Some(labels::owner(&name, operator_ns)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(labels::forwarder_selector()),
            ports: Some(vec![ServicePort {
                name: Some(binding.spec.scheme.to_string()),
                protocol: Some(target.protocol.clone()),
                port: target.port,
                target_port: Some(IntOrString::Int(local_port.into())),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn is_owned_by(svc: &Service, name: &str, namespace: &str) -> bool {
    svc.metadata
        .labels
        .as_ref()
        .and_then(labels::owner_of)
        .is_some_and(|owner| owner == (name, namespace))
}

/// Applies the desired labels, annotations and routing fields onto
/// `existing`. Returns `None` if nothing would change.
///
/// Fields assigned by the API server, such as the cluster IP, are kept.
pub fn merge(existing: &Service, desired: &Service) -> Option<Service> {
    let mut merged = existing.clone();

    if let Some(labels) = &desired.metadata.labels {
        merged
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .extend(labels.clone());
    }
    if let Some(annotations) = &desired.metadata.annotations {
        merged
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .extend(annotations.clone());
    }

    let want = desired.spec.clone().unwrap_or_default();
    let spec = merged.spec.get_or_insert_with(Default::default);
    spec.type_ = want.type_;
    spec.external_name = want.external_name;
    spec.selector = want.selector;
    spec.ports = want.ports;

    if merged == *existing {
        return None;
    }
    Some(merged)
}
