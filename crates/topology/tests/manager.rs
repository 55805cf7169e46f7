use std::sync::Arc;
use std::time::Duration;

use gatehouse_topology::{Node, NodeId, PeerDirectory, TopologyManager, TopologyManagerConfig};
use gatehouse_topology_mock::MockTopologyAdaptor;

fn node(id: &str) -> Node {
    Node::new(id.parse().unwrap(), "10.0.0.1")
}

#[tokio::test]
async fn test_known_peers_excludes_local_node() {
    let adaptor = Arc::new(MockTopologyAdaptor::new(vec![
        node("node-a:9090"),
        node("node-b:9090"),
        node("node-c:9090"),
    ]));
    let local: NodeId = "node-a:9090".parse().unwrap();
    let manager = TopologyManager::new(adaptor, local.clone());

    manager.refresh_topology().await.unwrap();

    let peers = manager.known_peers().await;
    assert_eq!(peers.len(), 2);
    assert!(peers.iter().all(|peer| peer.node_id != local));
    assert_eq!(manager.get_all_nodes().await.len(), 3);
}

#[tokio::test]
async fn test_refresh_failure_keeps_cached_nodes() {
    let adaptor = Arc::new(MockTopologyAdaptor::new(vec![
        node("node-a:9090"),
        node("node-b:9090"),
    ]));
    let manager = TopologyManager::new(adaptor.clone(), "node-a:9090".parse().unwrap());
    manager.refresh_topology().await.unwrap();

    adaptor.set_unavailable(true);
    assert!(manager.refresh_topology().await.is_err());
    assert_eq!(manager.known_peers().await.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_background_refresh_picks_up_new_peer() {
    let adaptor = Arc::new(MockTopologyAdaptor::new(vec![
        node("node-a:9090"),
        node("node-b:9090"),
    ]));
    let manager = TopologyManager::with_config(
        adaptor.clone(),
        "node-a:9090".parse().unwrap(),
        TopologyManagerConfig {
            refresh_interval: Duration::from_secs(1),
        },
    );
    manager.start().await.unwrap();
    assert_eq!(manager.known_peers().await.len(), 1);

    adaptor.add_node(node("node-d:9090")).unwrap();
    tokio::time::sleep(Duration::from_millis(1500)).await;

    let peer = manager.get_peer(&"node-d:9090".parse().unwrap()).await;
    assert!(peer.is_some());

    manager.shutdown().await.unwrap();
}
