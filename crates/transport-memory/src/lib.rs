//! In-memory transport implementation for testing
//!
//! Routes deliveries between nodes within the same process. Every node
//! registers its [`DeliveryHandler`] on a shared [`MemoryNetwork`]; faults
//! can be injected per node to simulate unreachable or hanging peers.

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use gatehouse_topology::{Node, NodeId};
use gatehouse_transport::{
    DeliveryAck, DeliveryHandler, DeliveryOutcome, EventTransport, TransportError,
};
use tracing::debug;

/// Simulated failure mode of a node
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum PeerFault {
    /// Deliveries reach the handler
    #[default]
    Healthy,
    /// Deliveries fail immediately with a connection error
    Unreachable,
    /// Deliveries never complete
    Unresponsive,
    /// Deliveries are answered with a rejection
    Reject(String),
}

struct PeerEntry {
    handler: Option<Arc<dyn DeliveryHandler>>,
    fault: PeerFault,
    attempts: Arc<AtomicU64>,
}

impl Default for PeerEntry {
    fn default() -> Self {
        Self {
            handler: None,
            fault: PeerFault::Healthy,
            attempts: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// Shared routing table of in-process nodes
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    peers: Arc<DashMap<NodeId, PeerEntry>>,
}

impl MemoryNetwork {
    /// Create an empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler answering deliveries to `node_id`
    pub fn register(&self, node_id: NodeId, handler: Arc<dyn DeliveryHandler>) {
        debug!("Registering memory handler for node {}", node_id);
        self.peers.entry(node_id).or_default().handler = Some(handler);
    }

    /// Remove the handler for `node_id`; later deliveries fail to connect
    pub fn unregister(&self, node_id: &NodeId) {
        if let Some(mut entry) = self.peers.get_mut(node_id) {
            entry.handler = None;
        }
    }

    /// Inject a fault for deliveries to `node_id`
    pub fn set_fault(&self, node_id: &NodeId, fault: PeerFault) {
        debug!("Setting fault {:?} for node {}", fault, node_id);
        self.peers.entry(node_id.clone()).or_default().fault = fault;
    }

    /// Number of delivery attempts addressed to `node_id` so far
    pub fn attempts(&self, node_id: &NodeId) -> u64 {
        self.peers
            .get(node_id)
            .map_or(0, |entry| entry.attempts.load(Ordering::SeqCst))
    }

    /// Transport sending on behalf of `local`
    pub fn transport(&self, local: NodeId) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            local,
        }
    }
}

impl Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryNetwork")
            .field("peers", &self.peers.len())
            .finish()
    }
}

/// Memory transport bound to one sending node
#[derive(Clone, Debug)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    local: NodeId,
}

impl MemoryTransport {
    /// Node this transport sends as
    pub const fn local(&self) -> &NodeId {
        &self.local
    }
}

#[async_trait]
impl EventTransport for MemoryTransport {
    async fn deliver(
        &self,
        event_id: &str,
        target: &Node,
        payload: Bytes,
    ) -> Result<DeliveryAck, TransportError> {
        let node_id = target.node_id();

        // Snapshot the entry so no map guard is held across an await
        let (handler, fault) = {
            let entry = self.network.peers.entry(node_id.clone()).or_default();
            entry.attempts.fetch_add(1, Ordering::SeqCst);
            (entry.handler.clone(), entry.fault.clone())
        };

        debug!(
            "Memory delivery of {} from {} to {} ({} bytes)",
            event_id,
            self.local,
            node_id,
            payload.len()
        );

        let outcome = match fault {
            PeerFault::Unreachable => {
                return Err(TransportError::ConnectionFailed(
                    node_id.clone(),
                    "peer unreachable".to_string(),
                ));
            }
            PeerFault::Unresponsive => std::future::pending().await,
            PeerFault::Reject(reason) => DeliveryOutcome::Rejected { reason },
            PeerFault::Healthy => {
                let handler = handler.ok_or_else(|| {
                    TransportError::ConnectionFailed(
                        node_id.clone(),
                        "no handler registered".to_string(),
                    )
                })?;
                handler.handle(&self.local, event_id, payload).await
            }
        };

        Ok(DeliveryAck {
            event_id: event_id.to_string(),
            node_id: node_id.clone(),
            outcome,
        })
    }
}
