//! Gateway node binary: runs the service group registry and the event
//! distributor for one node of the cluster.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::redundant_pub_crate)]

mod config;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use gatehouse_bootable::Bootable;
use gatehouse_locks_memory::MemoryLockManager;
use gatehouse_registry::{
    ContextBuilder, DEFAULT_INBOX_RETENTION, EventDistributor, EventInbox, EventSource,
    GroupReplica, NewServiceGroup, RegistryManagement, RegistryManager, StaticDependencies,
    with_event_source,
};
use gatehouse_storage_memory::MemoryStorage;
use gatehouse_topology::{StaticTopologyAdaptor, TopologyError, TopologyManager};
use gatehouse_transport_memory::MemoryNetwork;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::NodeConfig;

/// CLI-specific error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Lifecycle error of a background service
    #[error("boot error: {0}")]
    Boot(String),

    /// Configuration file error
    #[error("config error: {0}")]
    Config(String),

    /// Registry error
    #[error(transparent)]
    Registry(#[from] gatehouse_registry::Error),

    /// Topology error
    #[error(transparent)]
    Topology(#[from] TopologyError),
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the node configuration file
    #[arg(long, default_value = "gatehouse.toml", env = "GATEHOUSE_CONFIG")]
    config: PathBuf,

    /// Log filter, in `RUST_LOG` syntax
    #[arg(long, default_value = "info", env = "GATEHOUSE_LOG")]
    log: String,

    /// Host an inbox for every configured peer inside this process
    #[arg(long, env = "GATEHOUSE_SIMULATE_PEERS")]
    simulate_peers: bool,

    /// Tenant the seed groups are created in
    #[arg(long, default_value = "default", env = "GATEHOUSE_SEED_TENANT")]
    seed_tenant: String,

    /// Groups to register on startup
    #[arg(long, value_delimiter = ',', env = "GATEHOUSE_SEED_GROUPS")]
    seed_groups: Vec<String>,
}

async fn run(args: Args, shutdown_token: CancellationToken) -> Result<(), Error> {
    let config = NodeConfig::from_file(&args.config)?;
    let local = config.node.clone();

    info!(
        node_id = %local.node_id(),
        peers = config.peers.len(),
        "Starting gateway node"
    );

    let topology = Arc::new(TopologyManager::new(
        Arc::new(StaticTopologyAdaptor::new(config.cluster())),
        local.node_id().clone(),
    ));
    topology.start().await?;

    let network = MemoryNetwork::new();
    if args.simulate_peers {
        let retention = config
            .registry
            .distributor
            .event_ttl
            .unwrap_or(DEFAULT_INBOX_RETENTION);
        for peer in &config.peers {
            info!(node_id = %peer.node_id(), "Simulating peer inbox");
            network.register(
                peer.node_id().clone(),
                Arc::new(EventInbox::with_retention(GroupReplica::new(), retention)),
            );
        }
    } else if !config.peers.is_empty() {
        warn!("Peers are unreachable without --simulate-peers; events will wait for the reaper");
    }

    let storage = MemoryStorage::new();
    let distributor = EventDistributor::new(
        storage.clone(),
        network.transport(local.node_id().clone()),
        Arc::clone(&topology),
        config.registry.distributor.clone(),
    );

    let registry = RegistryManager::new(
        storage,
        MemoryLockManager::new(),
        StaticDependencies::new(),
        local,
        distributor.intake(),
        config.registry.clone(),
    );

    distributor
        .start()
        .await
        .map_err(|e| Error::Boot(e.to_string()))?;

    let ctx = with_event_source(
        ContextBuilder::new(&args.seed_tenant),
        EventSource::Internal,
    );
    for group_name in &args.seed_groups {
        match registry
            .create_group(&ctx, NewServiceGroup::new(group_name, "system"))
            .await
        {
            Ok(group) => info!(
                service_group_id = %group.service_group_id,
                %group_name,
                "Registered seed group"
            ),
            Err(e) => error!(%group_name, "Failed to register seed group: {e}"),
        }
    }

    tokio::select! {
        () = shutdown_token.cancelled() => {}
        () = distributor.wait() => warn!("Event distributor stopped unexpectedly"),
    }

    distributor
        .shutdown()
        .await
        .map_err(|e| Error::Boot(e.to_string()))?;
    topology.shutdown().await?;

    info!("Gateway node stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log))
        .init();

    // Create shared shutdown token
    let shutdown_token = CancellationToken::new();

    // Set up signal handlers
    let signal_shutdown_token = shutdown_token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received interrupt signal"),
            Err(e) => error!("Failed to listen for interrupt: {e}"),
        }

        info!("Shutting down");
        signal_shutdown_token.cancel();
    });

    run(args, shutdown_token).await
}
