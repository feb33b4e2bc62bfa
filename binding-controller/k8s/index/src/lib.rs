//! Keeps BoundEndpoints in step with the remote endpoint API and projects
//! each one into the cluster.
//!
//! Two loops cooperate through the BoundEndpoint resources:
//!
//! - The [`Poller`] lists remote endpoints on an interval, groups them by
//!   routing 4-tuple, and creates, updates or deletes BoundEndpoints to
//!   match. It owns the allocation of local ports.
//! - The [`binding`] reconciler watches BoundEndpoints and creates the
//!   ExternalName Service in the target namespace and the ClusterIP Service
//!   fronting the forwarder, then verifies connectivity.
//!
//! ```text
//! [ remote API ] -> Poller -> [ BoundEndpoint ] -> reconciler -> [ Service ] x2
//! ```
//!
//! Services live in other namespaces than their owner, so they're tied back
//! by labels, and the [`OwnerIndex`] maps Namespace events back to the
//! bindings that target them.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod binding;
pub mod metrics;
mod owners;
mod poller;
pub mod store;

#[cfg(test)]
mod test_util;

pub use self::{
    metrics::{PollerMetrics, ReconcileMetrics},
    owners::{OwnerIndex, OwnerRef, SharedOwnerIndex},
    poller::{Pass, PollError, Poller},
    store::{BindingStore, KubeBindingStore, KubeServiceStore, ServiceStore, StoreError},
};
