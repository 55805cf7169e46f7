//! Transport error types

use gatehouse_topology::NodeId;

/// Errors raised while delivering to a peer
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The peer could not be reached
    #[error("Connection to {0} failed: {1}")]
    ConnectionFailed(NodeId, String),

    /// The connection was closed mid-request
    #[error("Connection closed")]
    ConnectionClosed,

    /// No route is known for the target
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// The payload exceeded the configured size limit
    #[error("Payload of {size} bytes exceeds limit of {limit} bytes")]
    PayloadTooLarge {
        /// Payload size in bytes
        size: usize,
        /// Configured limit in bytes
        limit: usize,
    },

    /// Other transport error
    #[error("Transport error: {0}")]
    Other(String),
}
