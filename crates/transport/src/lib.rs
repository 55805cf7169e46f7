//! Inter-node transport abstraction for cluster event delivery
//!
//! A transport performs one request/response exchange per call: it carries
//! an encoded event to a peer and returns the peer's acknowledgment.
//! Deadlines are the caller's concern; implementations may block for as
//! long as the peer takes to answer.

pub mod error;

use async_trait::async_trait;
use bytes::Bytes;
use gatehouse_topology::{Node, NodeId};
use serde::{Deserialize, Serialize};

pub use error::TransportError;

/// What the receiving node did with a delivered event
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeliveryOutcome {
    /// The event was applied
    Applied,

    /// The event id had already been applied; nothing changed
    AlreadyApplied,

    /// The peer refused the event
    Rejected {
        /// Reason given by the peer
        reason: String,
    },
}

/// A peer's answer to one delivery
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryAck {
    /// Event the answer refers to
    pub event_id: String,
    /// Node that answered
    pub node_id: NodeId,
    /// Outcome on the peer
    pub outcome: DeliveryOutcome,
}

impl DeliveryAck {
    /// Whether the peer now holds the event
    pub const fn is_positive(&self) -> bool {
        matches!(
            self.outcome,
            DeliveryOutcome::Applied | DeliveryOutcome::AlreadyApplied
        )
    }
}

/// Sending side of event delivery
#[async_trait]
pub trait EventTransport: Send + Sync + 'static {
    /// Deliver an encoded event to `target` and wait for its answer
    async fn deliver(
        &self,
        event_id: &str,
        target: &Node,
        payload: Bytes,
    ) -> Result<DeliveryAck, TransportError>;
}

/// Receiving side of event delivery, implemented by each node's inbox
#[async_trait]
pub trait DeliveryHandler: Send + Sync + 'static {
    /// Handle one delivered event
    async fn handle(&self, sender: &NodeId, event_id: &str, payload: Bytes) -> DeliveryOutcome;
}

#[async_trait]
impl<T: EventTransport> EventTransport for std::sync::Arc<T> {
    async fn deliver(
        &self,
        event_id: &str,
        target: &Node,
        payload: Bytes,
    ) -> Result<DeliveryAck, TransportError> {
        (**self).deliver(event_id, target, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positive_outcomes() {
        let node_id: NodeId = "node-b:9090".parse().unwrap();
        let mut ack = DeliveryAck {
            event_id: "EVT20240101000000abcd".to_string(),
            node_id,
            outcome: DeliveryOutcome::Applied,
        };
        assert!(ack.is_positive());

        ack.outcome = DeliveryOutcome::AlreadyApplied;
        assert!(ack.is_positive());

        ack.outcome = DeliveryOutcome::Rejected {
            reason: "unknown tenant".to_string(),
        };
        assert!(!ack.is_positive());
    }
}
