//! Error types for the mock topology adaptor implementation.

use gatehouse_topology::{TopologyAdaptorError, TopologyAdaptorErrorKind};
use thiserror::Error;

/// Error type for the mock topology adaptor implementation.
#[derive(Debug, Error)]
pub enum Error {
    /// Error when a node is not found in the topology.
    #[error("Node not found: {0}")]
    NodeNotFound(String),

    /// Error when managing nodes in the topology.
    #[error("Node management error: {0}")]
    NodeManagement(String),

    /// Simulated outage of the membership source.
    #[error("Topology source unavailable")]
    Unavailable,
}

impl TopologyAdaptorError for Error {
    fn kind(&self) -> TopologyAdaptorErrorKind {
        match self {
            Self::NodeNotFound(_) => TopologyAdaptorErrorKind::NodeNotFound,
            Self::Unavailable => TopologyAdaptorErrorKind::External,
            Self::NodeManagement(_) => TopologyAdaptorErrorKind::Other,
        }
    }
}
