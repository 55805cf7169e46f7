//! Simple error types for topology operations

use std::error::Error;
use std::fmt::{self, Debug};
use thiserror::Error as ThisError;

/// Topology-related errors
#[derive(Clone, Debug, ThisError, PartialEq, Eq)]
pub enum TopologyError {
    /// A node identifier could not be parsed
    #[error("Invalid node id '{0}': expected hostname:port")]
    InvalidNodeId(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Topology adaptor error
    #[error("Topology adaptor error: {0}")]
    TopologyAdaptor(String),
}

/// Marker trait for `TopologyAdaptor` errors
pub trait TopologyAdaptorError: Debug + Error + Send + Sync + 'static {
    /// Returns the kind of this error
    fn kind(&self) -> TopologyAdaptorErrorKind;
}

/// The kind of topology adaptor error.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum TopologyAdaptorErrorKind {
    /// Error when a node is not found in the topology
    NodeNotFound,

    /// Error with an external membership source
    External,

    /// Other/unknown error
    Other,
}

impl fmt::Display for TopologyAdaptorErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Error type for topologies that cannot fail.
#[derive(Clone, Copy, Debug, ThisError)]
#[error("static topology never fails")]
pub struct NeverFails;

impl TopologyAdaptorError for NeverFails {
    fn kind(&self) -> TopologyAdaptorErrorKind {
        TopologyAdaptorErrorKind::Other
    }
}
