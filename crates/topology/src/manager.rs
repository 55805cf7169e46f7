//! Cached cluster membership with periodic refresh

use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adaptor::{PeerDirectory, TopologyAdaptor};
use crate::{Node, NodeId, TopologyError};

/// Configuration for the topology manager
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyManagerConfig {
    /// Interval between membership refreshes
    pub refresh_interval: Duration,
}

impl Default for TopologyManagerConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(30),
        }
    }
}

/// Peers that appeared or disappeared between two refreshes.
#[derive(Debug, Default, PartialEq, Eq)]
struct MembershipChange {
    joined: Vec<NodeId>,
    departed: Vec<NodeId>,
}

impl MembershipChange {
    fn between(previous: &[Node], current: &[Node]) -> Self {
        let before: HashSet<&NodeId> = previous.iter().map(Node::node_id).collect();
        let after: HashSet<&NodeId> = current.iter().map(Node::node_id).collect();

        Self {
            joined: after.difference(&before).map(|id| (*id).clone()).collect(),
            departed: before.difference(&after).map(|id| (*id).clone()).collect(),
        }
    }

    fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.departed.is_empty()
    }
}

struct Shared<T> {
    adaptor: Arc<T>,
    node_id: NodeId,
    nodes: RwLock<Vec<Node>>,
}

impl<T: TopologyAdaptor> Shared<T> {
    async fn refresh(&self) -> Result<(), TopologyError> {
        let nodes = self
            .adaptor
            .get_topology()
            .await
            .map_err(|e| TopologyError::TopologyAdaptor(e.to_string()))?;

        let mut cached = self.nodes.write().await;
        let change = MembershipChange::between(&cached, &nodes);

        // Addresses may change without membership changing
        if change.is_empty() && *cached == nodes {
            debug!(node_id = %self.node_id, "Topology unchanged");
            return Ok(());
        }

        for joined in &change.joined {
            info!(node_id = %self.node_id, peer = %joined, "Node joined the cluster");
        }
        for departed in &change.departed {
            info!(node_id = %self.node_id, peer = %departed, "Node left the cluster");
        }

        *cached = nodes;
        Ok(())
    }
}

/// Caches the cluster membership reported by a [`TopologyAdaptor`].
pub struct TopologyManager<T>
where
    T: TopologyAdaptor,
{
    shared: Arc<Shared<T>>,
    config: TopologyManagerConfig,
    shutdown: CancellationToken,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl<T> TopologyManager<T>
where
    T: TopologyAdaptor,
{
    /// Create a new topology manager with default configuration
    pub fn new(topology_adaptor: Arc<T>, node_id: NodeId) -> Self {
        Self::with_config(topology_adaptor, node_id, TopologyManagerConfig::default())
    }

    /// Create a new topology manager with custom configuration
    pub fn with_config(
        topology_adaptor: Arc<T>,
        node_id: NodeId,
        config: TopologyManagerConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                adaptor: topology_adaptor,
                node_id,
                nodes: RwLock::new(Vec::new()),
            }),
            config,
            shutdown: CancellationToken::new(),
            refresh_task: Mutex::new(None),
        }
    }

    /// Load the membership once, then keep refreshing it in the background.
    ///
    /// # Errors
    ///
    /// Fails if the initial load fails; later refresh failures only log
    /// and keep the last known membership.
    pub async fn start(&self) -> Result<(), TopologyError> {
        self.refresh_topology().await?;

        let mut refresh_task = self.refresh_task.lock();
        if refresh_task.is_some() {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let shutdown = self.shutdown.clone();
        let period = self.config.refresh_interval;

        *refresh_task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(e) = shared.refresh().await {
                            warn!(node_id = %shared.node_id, "Failed to refresh topology: {e}");
                        }
                    }
                }
            }
        }));

        info!(
            node_id = %self.shared.node_id,
            refresh_interval = ?period,
            "Topology manager started"
        );
        Ok(())
    }

    /// Stop the background refresh
    ///
    /// # Errors
    ///
    /// Never fails today; the signature leaves room for adaptors that hold
    /// connections.
    pub async fn shutdown(&self) -> Result<(), TopologyError> {
        self.shutdown.cancel();

        let refresh_task = self.refresh_task.lock().take();
        if let Some(task) = refresh_task
            && let Err(e) = task.await
        {
            warn!("Topology refresh task ended abnormally: {e}");
        }

        Ok(())
    }

    /// Reload the membership from the adaptor now
    ///
    /// # Errors
    ///
    /// Returns [`TopologyError::TopologyAdaptor`] if the adaptor fails; the
    /// cached membership is left as it was.
    pub async fn refresh_topology(&self) -> Result<(), TopologyError> {
        self.shared.refresh().await
    }

    /// Get all nodes, including the local one
    pub async fn get_all_nodes(&self) -> Vec<Node> {
        self.shared.nodes.read().await.clone()
    }

    /// Get a specific node by id
    pub async fn get_peer(&self, node_id: &NodeId) -> Option<Node> {
        self.shared
            .nodes
            .read()
            .await
            .iter()
            .find(|node| node.node_id() == node_id)
            .cloned()
    }
}

#[async_trait]
impl<T> PeerDirectory for TopologyManager<T>
where
    T: TopologyAdaptor,
{
    fn local_node_id(&self) -> &NodeId {
        &self.shared.node_id
    }

    async fn known_peers(&self) -> Vec<Node> {
        let local = &self.shared.node_id;

        self.shared
            .nodes
            .read()
            .await
            .iter()
            .filter(|node| node.node_id() != local)
            .cloned()
            .collect()
    }
}

impl<T: TopologyAdaptor> Debug for TopologyManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopologyManager")
            .field("node_id", &self.shared.node_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
