use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, str::FromStr};

/// Binds one or more remote endpoints that share a routing 4-tuple to a pair
/// of in-cluster Services.
///
/// The resource name is derived from `endpointURI`, so two endpoints with the
/// same scheme, service, namespace and port always collapse into a single
/// BoundEndpoint.
#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "bindings.k8s.ngrok.com",
    version = "v1alpha1",
    kind = "BoundEndpoint",
    status = "BoundEndpointStatus",
    namespaced,
    derive = "PartialEq",
    printcolumn = r#"{"name":"URI","type":"string","jsonPath":".spec.endpointURI"}"#,
    printcolumn = r#"{"name":"Port","type":"integer","jsonPath":".spec.port"}"#,
    printcolumn = r#"{"name":"Endpoints","type":"string","jsonPath":".status.endpointsSummary"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BoundEndpointSpec {
    /// Canonical `scheme://service.namespace:port` form of the 4-tuple.
    #[serde(rename = "endpointURI")]
    pub endpoint_uri: String,

    pub scheme: Scheme,

    /// The local port allocated to this binding. The forwarder listens here
    /// and the upstream ClusterIP Service targets it.
    pub port: u16,

    pub target: EndpointTarget,

    /// Whether the binding is permitted by the operator's allow policy.
    #[serde(default)]
    pub allowed: bool,
}

/// The in-cluster Service that the binding projects.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EndpointTarget {
    pub service: String,
    pub namespace: String,
    /// Transport protocol of the projected Service port. Always `TCP` today.
    pub protocol: String,
    pub port: i32,
    #[serde(default)]
    pub metadata: TargetMetadata,
}

/// Extra metadata stamped onto the projected Service.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct TargetMetadata {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BoundEndpointStatus {
    /// The remote endpoints sharing this binding. Every entry carries the same
    /// status since they all share one pair of Services.
    #[serde(default)]
    pub endpoints: Vec<BindingEndpoint>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hashed_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoints_summary: Option<String>,

    #[serde(default)]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_service_ref: Option<ServiceRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upstream_service_ref: Option<ServiceRef>,
}

/// A reference to one remote endpoint record.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BindingEndpoint {
    pub id: String,
    pub uri: String,
    #[serde(default)]
    pub status: EndpointStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum EndpointStatus {
    #[default]
    Unknown,
    Provisioning,
    Bound,
    Error,
    Denied,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// A status condition on a BoundEndpoint.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub typ: String,
    pub status: ConditionStatus,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// RFC 3339 timestamp of the last status change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Deserialize, Serialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// The schemes a binding may be exposed with.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Tcp,
    Http,
    Https,
    Tls,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unsupported scheme: {0:?}")]
pub struct InvalidScheme(pub String);

// === impl BoundEndpoint ===

impl BoundEndpoint {
    /// The local port allocated to this binding, if one has been assigned.
    pub fn local_port(&self) -> Option<u16> {
        match self.spec.port {
            0 => None,
            port => Some(port),
        }
    }

    pub fn endpoint_ids(&self) -> impl Iterator<Item = &str> {
        self.status
            .iter()
            .flat_map(|s| s.endpoints.iter())
            .map(|ep| ep.id.as_str())
    }
}

// === impl Scheme ===

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::Http => "http",
            Self::Https => "https",
            Self::Tls => "tls",
        }
    }

    /// The port implied by the scheme when none is given. `tcp` has no
    /// default.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::Tcp => None,
            Self::Http => Some(80),
            Self::Https | Self::Tls => Some(443),
        }
    }
}

impl FromStr for Scheme {
    type Err = InvalidScheme;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tcp" => Ok(Self::Tcp),
            "http" => Ok(Self::Http),
            "https" => Ok(Self::Https),
            "tls" => Ok(Self::Tls),
            _ => Err(InvalidScheme(s.to_string())),
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// === impl ConditionStatus ===

impl From<bool> for ConditionStatus {
    fn from(ok: bool) -> Self {
        if ok {
            Self::True
        } else {
            Self::False
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_strings() {
        for scheme in [Scheme::Tcp, Scheme::Http, Scheme::Https, Scheme::Tls] {
            assert_eq!(scheme.as_str().parse::<Scheme>(), Ok(scheme));
        }
        assert_eq!("udp".parse::<Scheme>(), Err(InvalidScheme("udp".into())));
        assert_eq!("HTTPS".parse::<Scheme>(), Err(InvalidScheme("HTTPS".into())));
    }

    #[test]
    fn spec_wire_names() {
        let spec = BoundEndpointSpec {
            endpoint_uri: "https://svc.ns:443".to_string(),
            scheme: Scheme::Https,
            port: 10000,
            target: EndpointTarget {
                service: "svc".to_string(),
                namespace: "ns".to_string(),
                protocol: "TCP".to_string(),
                port: 443,
                metadata: TargetMetadata::default(),
            },
            allowed: true,
        };
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["endpointURI"], "https://svc.ns:443");
        assert_eq!(value["scheme"], "https");
        assert_eq!(value["target"]["port"], 443);

        let status = BindingEndpoint {
            id: "ep_1".to_string(),
            uri: "/endpoints/ep_1".to_string(),
            status: EndpointStatus::Provisioning,
            error_code: None,
            error_message: None,
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["status"], "provisioning");
        assert!(value.get("errorCode").is_none());
    }
}
