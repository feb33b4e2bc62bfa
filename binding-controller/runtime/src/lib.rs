#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use binding_controller_core as core;
pub use binding_controller_forwarder as forwarder;
pub use binding_controller_k8s_api as k8s;
pub use binding_controller_k8s_index as index;

mod args;
mod index_list;
mod lease;
pub mod source;

pub use self::{args::Args, source::HttpEndpointSource};
