//! Peer node description

use serde::{Deserialize, Serialize};

use crate::NodeId;

/// A gateway node known to the cluster.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Node {
    /// Identity of the node (`hostname:port`)
    pub node_id: NodeId,

    /// Address the node is reachable at, recorded on acks
    pub ip: String,
}

impl Node {
    /// Create a new node.
    pub fn new(node_id: NodeId, ip: impl Into<String>) -> Self {
        Self {
            node_id,
            ip: ip.into(),
        }
    }

    /// Get the node ID of this node
    pub const fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Get the address of this node
    pub fn ip(&self) -> &str {
        &self.ip
    }
}
