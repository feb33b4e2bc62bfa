//! Serves the local ports allocated to BoundEndpoints.
//!
//! Every accepted connection is dialed through to the tunnel ingress over
//! mutual TLS, announced with a small length-prefixed handshake, and then
//! spliced byte-for-byte until either side closes.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod index;
mod listener;
pub mod metrics;
pub mod mux;
mod splice;
pub mod tunnel;

pub use self::{
    index::{Index, SharedIndex},
    listener::{ConnHandler, ListenerSet},
    metrics::ForwarderMetrics,
    splice::splice,
    tunnel::{
        ensure_crypto_provider, ClientCredentials, Dial, ForwardError, TunnelDialer, TunnelHandler,
    },
};
