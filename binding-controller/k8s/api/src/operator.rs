use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Describes the operator's registration with the remote service. The
/// forwarder reads it to find the tunnel ingress and its client certificate.
#[derive(Clone, Debug, Default, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "ngrok.k8s.ngrok.com",
    version = "v1alpha1",
    kind = "KubernetesOperator",
    status = "KubernetesOperatorStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesOperatorSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binding: Option<BindingConfig>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BindingConfig {
    /// Secret holding the `tls.crt` and `tls.key` used to authenticate to the
    /// tunnel ingress.
    pub tls_secret_name: String,

    /// Overrides the ingress endpoint reported in status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_endpoint: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesOperatorStatus {
    /// `host:port` of the tunnel ingress for binding connections.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bindings_ingress_endpoint: Option<String>,
}

impl KubernetesOperator {
    /// The tunnel ingress address, preferring an explicit override in spec.
    pub fn ingress_endpoint(&self) -> Option<&str> {
        self.spec
            .binding
            .as_ref()
            .and_then(|b| b.ingress_endpoint.as_deref())
            .or_else(|| {
                self.status
                    .as_ref()
                    .and_then(|s| s.bindings_ingress_endpoint.as_deref())
            })
    }

    pub fn tls_secret_name(&self) -> Option<&str> {
        self.spec.binding.as_ref().map(|b| b.tls_secret_name.as_str())
    }
}
