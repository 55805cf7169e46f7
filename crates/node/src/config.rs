//! Node configuration file

use std::path::Path;

use gatehouse_registry::RegistryConfig;
use gatehouse_topology::Node;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Contents of the node's TOML configuration file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Identity of this node.
    pub node: Node,

    /// The other gateway nodes of the cluster.
    #[serde(default)]
    pub peers: Vec<Node>,

    /// Registry and distributor settings.
    #[serde(default)]
    pub registry: RegistryConfig,
}

impl NodeConfig {
    /// Read and parse a configuration file.
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;

        Self::parse(&contents)
    }

    fn parse(contents: &str) -> Result<Self, Error> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| Error::Config(format!("failed to parse config: {e}")))?;

        if config
            .peers
            .iter()
            .any(|peer| peer.node_id == config.node.node_id)
        {
            return Err(Error::Config(format!(
                "node {} lists itself as a peer",
                config.node.node_id
            )));
        }

        Ok(config)
    }

    /// Every node of the cluster, this one first.
    pub fn cluster(&self) -> Vec<Node> {
        std::iter::once(self.node.clone())
            .chain(self.peers.iter().cloned())
            .collect()
    }
}
