//! Mock topology adaptor for tests and local clusters.
#![warn(missing_docs)]
#![warn(clippy::all)]

mod error;

pub use error::Error;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use gatehouse_topology::{Node, NodeId, TopologyAdaptor};
use parking_lot::RwLock;
use tracing::debug;

/// Mock topology whose membership can be changed at runtime.
#[derive(Clone, Debug, Default)]
pub struct MockTopologyAdaptor {
    nodes: Arc<RwLock<Vec<Node>>>,
    unavailable: Arc<AtomicBool>,
}

impl MockTopologyAdaptor {
    /// Create a mock topology with an initial set of nodes.
    pub fn new(nodes: Vec<Node>) -> Self {
        Self {
            nodes: Arc::new(RwLock::new(nodes)),
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Add a node to the topology.
    ///
    /// # Errors
    ///
    /// Returns an error if a node with the same id is already present.
    pub fn add_node(&self, node: Node) -> Result<(), Error> {
        let mut nodes = self.nodes.write();

        if nodes.iter().any(|n| n.node_id == node.node_id) {
            return Err(Error::NodeManagement(format!(
                "Node {} already exists",
                node.node_id
            )));
        }

        debug!(node_id = %node.node_id, "Adding node to mock topology");
        nodes.push(node);

        Ok(())
    }

    /// Remove a node from the topology.
    ///
    /// # Errors
    ///
    /// Returns an error if the node is not present.
    pub fn remove_node(&self, node_id: &NodeId) -> Result<Node, Error> {
        let mut nodes = self.nodes.write();

        let position = nodes
            .iter()
            .position(|n| &n.node_id == node_id)
            .ok_or_else(|| Error::NodeNotFound(node_id.to_string()))?;

        debug!(node_id = %node_id, "Removing node from mock topology");
        Ok(nodes.remove(position))
    }

    /// Make subsequent topology fetches fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl TopologyAdaptor for MockTopologyAdaptor {
    type Error = Error;

    async fn get_topology(&self) -> Result<Vec<Node>, Self::Error> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::Unavailable);
        }

        Ok(self.nodes.read().clone())
    }
}
