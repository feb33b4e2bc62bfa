#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod binding;
pub mod labels;
pub mod operator;

pub use self::{
    binding::{
        BindingEndpoint, BoundEndpoint, BoundEndpointSpec, BoundEndpointStatus, Condition,
        ConditionStatus, EndpointStatus, EndpointTarget, Scheme, ServiceRef, TargetMetadata,
    },
    operator::{BindingConfig, KubernetesOperator, KubernetesOperatorSpec, KubernetesOperatorStatus},
};
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{Namespace, Secret, Service, ServicePort, ServiceSpec},
    },
    apimachinery::{self, pkg::util::intstr::IntOrString},
    ByteString,
};
pub use kube::{
    api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams, ResourceExt},
    error::ErrorResponse,
    runtime::watcher,
    Client, Error, Resource,
};

/// Returns true if the error is an API response with the given HTTP status code.
pub fn is_status(error: &Error, code: u16) -> bool {
    matches!(error, Error::Api(ErrorResponse { code: c, .. }) if *c == code)
}

#[inline]
pub fn is_not_found(error: &Error) -> bool {
    is_status(error, 404)
}

#[inline]
pub fn is_conflict(error: &Error) -> bool {
    is_status(error, 409)
}
