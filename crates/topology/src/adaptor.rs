//! Membership sources for the cluster

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{NeverFails, TopologyAdaptorError};
use crate::{Node, NodeId};

/// Source of truth for cluster membership.
#[async_trait]
pub trait TopologyAdaptor: Send + Sync + 'static {
    /// The error type returned by this adaptor.
    type Error: TopologyAdaptorError;

    /// Fetch every node currently in the cluster, including the local one.
    async fn get_topology(&self) -> Result<Vec<Node>, Self::Error>;
}

/// The set of peers the event distributor fans out to.
#[async_trait]
pub trait PeerDirectory: Send + Sync + 'static {
    /// Identity of the local node (never part of `known_peers`).
    fn local_node_id(&self) -> &NodeId;

    /// All known peers, excluding the local node.
    async fn known_peers(&self) -> Vec<Node>;
}

#[async_trait]
impl<T: PeerDirectory> PeerDirectory for Arc<T> {
    fn local_node_id(&self) -> &NodeId {
        (**self).local_node_id()
    }

    async fn known_peers(&self) -> Vec<Node> {
        (**self).known_peers().await
    }
}

/// Topology fixed at startup, typically read from configuration.
#[derive(Clone, Debug, Default)]
pub struct StaticTopologyAdaptor {
    nodes: Vec<Node>,
}

impl StaticTopologyAdaptor {
    /// Create a static topology from a list of nodes.
    pub const fn new(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }
}

#[async_trait]
impl TopologyAdaptor for StaticTopologyAdaptor {
    type Error = NeverFails;

    async fn get_topology(&self) -> Result<Vec<Node>, Self::Error> {
        Ok(self.nodes.clone())
    }
}
