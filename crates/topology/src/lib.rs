//! Cluster topology for gateway nodes.
//!
//! This crate provides:
//! - Node identity types (`NodeId` as `hostname:port`, `Node`)
//! - The `PeerDirectory` seam consulted by the event distributor
//! - A refreshing `TopologyManager` over a pluggable `TopologyAdaptor`
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adaptor;
pub mod error;
pub mod manager;
pub mod node;
pub mod node_id;

pub use adaptor::{PeerDirectory, StaticTopologyAdaptor, TopologyAdaptor};
pub use error::{TopologyAdaptorError, TopologyAdaptorErrorKind, TopologyError};
pub use manager::{TopologyManager, TopologyManagerConfig};
pub use node::Node;
pub use node_id::NodeId;
