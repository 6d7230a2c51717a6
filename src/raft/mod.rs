//! Consensus plumbing around openraft: storage adapters, HTTP transport, leader forwarding and
//! the [`FleetNode`] coordinator.

pub mod app;
pub mod forward;
pub mod http_rpc;
pub mod network_http;
pub mod node;
pub mod runtime;
pub mod storage;
pub mod types;

pub use node::{ApplyError, FleetNode, NodeSettings};
pub use types::{ClientResponse, NodeId, NodeMeta, TypeConfig};
