use crate::{hostport::parse_hostport, identity::identity, HostportError};
use binding_controller_k8s_api::{
    BindingEndpoint, BoundEndpoint, BoundEndpointSpec, BoundEndpointStatus, EndpointStatus,
    EndpointTarget, TargetMetadata,
};
use std::collections::{btree_map::Entry, BTreeMap};

/// Desired BoundEndpoints keyed by canonical endpoint URI.
pub type DesiredBindings = BTreeMap<String, BoundEndpoint>;

/// An endpoint record as reported by the remote API.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RemoteEndpoint {
    pub id: String,
    /// The API resource URI of the endpoint record.
    pub uri: String,
    pub proto: String,
    pub public_url: String,
}

#[derive(Debug, thiserror::Error)]
#[error("failed to parse endpoint {id}: {source}")]
pub struct AggregateError {
    pub id: String,
    #[source]
    pub source: HostportError,
}

/// Groups remote endpoints that share a routing 4-tuple into one desired
/// BoundEndpoint each.
///
/// The whole batch fails if any record cannot be parsed. Endpoint refs are
/// appended in input order.
pub fn aggregate(endpoints: &[RemoteEndpoint]) -> Result<DesiredBindings, AggregateError> {
    let mut desired = DesiredBindings::new();

    for ep in endpoints {
        let hostport = parse_hostport(&ep.proto, &ep.public_url).map_err(|source| {
            AggregateError {
                id: ep.id.clone(),
                source,
            }
        })?;
        let endpoint_uri = hostport.to_string();

        let binding = match desired.entry(endpoint_uri) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let name = identity(entry.key());
                let spec = BoundEndpointSpec {
                    endpoint_uri: entry.key().clone(),
                    scheme: hostport.scheme,
                    port: 0,
                    target: EndpointTarget {
                        service: hostport.service_name,
                        namespace: hostport.namespace,
                        protocol: "TCP".to_string(),
                        port: hostport.port.into(),
                        metadata: TargetMetadata::default(),
                    },
                    allowed: false,
                };
                let mut binding = BoundEndpoint::new(&name, spec);
                binding.status = Some(BoundEndpointStatus {
                    hashed_name: Some(name),
                    ..Default::default()
                });
                entry.insert(binding)
            }
        };

        let status = binding.status.get_or_insert_with(Default::default);
        status.endpoints.push(BindingEndpoint {
            id: ep.id.clone(),
            uri: ep.uri.clone(),
            status: EndpointStatus::Unknown,
            error_code: None,
            error_message: None,
        });
        status.endpoints_summary = Some(endpoints_summary(status.endpoints.len()));
    }

    Ok(desired)
}

/// A human-readable count of the endpoints sharing a binding.
pub fn endpoints_summary(n: usize) -> String {
    match n {
        1 => "1 endpoint".to_string(),
        n => format!("{n} endpoints"),
    }
}
