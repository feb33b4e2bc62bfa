//! Pure logic for turning remote endpoint records into BoundEndpoints.
//!
//! Nothing in this crate talks to a cluster. The poller and reconcilers in
//! `binding-controller-k8s-index` compose these pieces:
//!
//! ```text
//! [ RemoteEndpoint ]* -> aggregate -> { endpointURI => BoundEndpoint }
//!                                          |
//!        [ existing BoundEndpoint ]* -> diff -> create / update / delete
//! ```
//!
//! Every desired record is keyed by its canonical `scheme://service.namespace:port`
//! URI, and named by a stable hash of that URI.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod aggregate;
pub mod allow;
pub mod conditions;
pub mod diff;
pub mod hostport;
pub mod identity;
pub mod ports;

pub use self::{
    aggregate::{aggregate, AggregateError, DesiredBindings, RemoteEndpoint},
    allow::{AllowPolicy, InvalidPattern},
    diff::{diff, Actions, Update},
    hostport::{parse_hostport, Hostport, HostportError},
    identity::identity,
    ports::{parse_port_range, AllocError, PortAllocator},
};

/// Lists the remote endpoint records that should be bound into the cluster.
///
/// Paging and authentication are the implementation's concern; callers see a
/// single flat snapshot per call.
#[async_trait::async_trait]
pub trait EndpointSource: Send + Sync {
    async fn list_endpoints(&self) -> anyhow::Result<Vec<RemoteEndpoint>>;
}
