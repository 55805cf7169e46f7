//! Integration tests for memory transport

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use bytes::Bytes;
use gatehouse_topology::{Node, NodeId};
use gatehouse_transport::{DeliveryHandler, DeliveryOutcome, EventTransport, TransportError};
use gatehouse_transport_memory::{MemoryNetwork, PeerFault};
use parking_lot::Mutex;
use tokio::time::timeout;

/// Handler that answers `AlreadyApplied` for ids it has seen before
#[derive(Default)]
struct RecordingHandler {
    seen: Mutex<HashSet<String>>,
}

#[async_trait]
impl DeliveryHandler for RecordingHandler {
    async fn handle(&self, _sender: &NodeId, event_id: &str, _payload: Bytes) -> DeliveryOutcome {
        if self.seen.lock().insert(event_id.to_string()) {
            DeliveryOutcome::Applied
        } else {
            DeliveryOutcome::AlreadyApplied
        }
    }
}

fn node(addr: &str) -> Node {
    Node::new(addr.parse().unwrap(), "127.0.0.1".to_string())
}

#[tokio::test]
async fn test_deliver_to_registered_handler() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let network = MemoryNetwork::new();
    let peer = node("node-b:9090");
    network.register(peer.node_id().clone(), Arc::new(RecordingHandler::default()));

    let transport = network.transport("node-a:9090".parse().unwrap());

    let ack = transport
        .deliver("EVT1", &peer, Bytes::from("payload"))
        .await
        .unwrap();
    assert_eq!(ack.outcome, DeliveryOutcome::Applied);
    assert_eq!(ack.node_id, *peer.node_id());

    let ack = transport
        .deliver("EVT1", &peer, Bytes::from("payload"))
        .await
        .unwrap();
    assert_eq!(ack.outcome, DeliveryOutcome::AlreadyApplied);
    assert_eq!(network.attempts(peer.node_id()), 2);
}

#[tokio::test]
async fn test_unregistered_peer_fails_to_connect() {
    let network = MemoryNetwork::new();
    let transport = network.transport("node-a:9090".parse().unwrap());

    let result = transport
        .deliver("EVT1", &node("node-c:9090"), Bytes::new())
        .await;
    assert_matches!(result, Err(TransportError::ConnectionFailed(..)));
}

#[tokio::test]
async fn test_injected_faults() {
    let network = MemoryNetwork::new();
    let peer = node("node-b:9090");
    network.register(peer.node_id().clone(), Arc::new(RecordingHandler::default()));
    let transport = network.transport("node-a:9090".parse().unwrap());

    network.set_fault(peer.node_id(), PeerFault::Unreachable);
    assert_matches!(
        transport.deliver("EVT1", &peer, Bytes::new()).await,
        Err(TransportError::ConnectionFailed(..))
    );

    network.set_fault(peer.node_id(), PeerFault::Reject("full".to_string()));
    let ack = transport.deliver("EVT1", &peer, Bytes::new()).await.unwrap();
    assert!(!ack.is_positive());

    network.set_fault(peer.node_id(), PeerFault::Healthy);
    let ack = transport.deliver("EVT1", &peer, Bytes::new()).await.unwrap();
    assert_eq!(ack.outcome, DeliveryOutcome::Applied);
}

#[tokio::test(start_paused = true)]
async fn test_unresponsive_peer_never_answers() {
    let network = MemoryNetwork::new();
    let peer = node("node-b:9090");
    network.register(peer.node_id().clone(), Arc::new(RecordingHandler::default()));
    network.set_fault(peer.node_id(), PeerFault::Unresponsive);

    let transport = network.transport("node-a:9090".parse().unwrap());
    let result = timeout(
        Duration::from_secs(5),
        transport.deliver("EVT1", &peer, Bytes::new()),
    )
    .await;

    assert!(result.is_err());
    assert_eq!(network.attempts(peer.node_id()), 1);
}
