use std::time::Duration;

use gatehouse_storage::StorageError;
use gatehouse_topology::NodeId;
use gatehouse_transport::TransportError;
use thiserror::Error;

/// Result type for registry operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced synchronously to callers of the registry.
#[derive(Debug, Error)]
pub enum Error {
    /// No active group with that name exists for the tenant.
    #[error("service group '{group_name}' not found for tenant '{tenant_id}'")]
    GroupNotFound {
        /// Tenant searched.
        tenant_id: String,
        /// Name searched.
        group_name: String,
    },

    /// No cluster event with that id exists.
    #[error("cluster event '{0}' not found")]
    EventNotFound(String),

    /// The event was never dispatched to that node.
    #[error("no ack of cluster event '{event_id}' for node {node_id}")]
    AckNotFound {
        /// Event looked up.
        event_id: String,
        /// Node looked up.
        node_id: NodeId,
    },

    /// An active group with that name already exists for the tenant.
    #[error("service group '{group_name}' already exists for tenant '{tenant_id}'")]
    DuplicateName {
        /// Tenant of the conflicting group.
        tenant_id: String,
        /// Conflicting name.
        group_name: String,
    },

    /// The owner user id was empty.
    #[error("service group owner must not be empty")]
    InvalidOwner,

    /// The caller's expected version is stale.
    #[error("version conflict: expected {expected}, current {current}")]
    VersionConflict {
        /// Version the caller read.
        expected: u64,
        /// Version currently stored.
        current: u64,
    },

    /// Physical deletion was blocked by active dependents.
    #[error("service group '{group_name}' has {count} active dependents")]
    HasDependents {
        /// Group that could not be deleted.
        group_name: String,
        /// Number of dependents reported.
        count: u64,
    },

    /// The caller may not perform this operation.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// A malformed argument was supplied.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An ack transition not allowed by the state machine was attempted.
    #[error("invalid ack transition from {from} to {to}")]
    InvalidTransition {
        /// Current status.
        from: crate::AckStatus,
        /// Requested status.
        to: crate::AckStatus,
    },

    /// The dependency checker could not answer.
    #[error(transparent)]
    DependencyCheck(#[from] crate::DependencyCheckError),

    /// Lock acquisition failed.
    #[error("lock error: {0}")]
    Lock(String),

    /// CBOR encoding or decoding failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// Errors passed through from the underlying store.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Why a single delivery attempt did not succeed.
///
/// These never reach the caller of a mutation; they end up in ack result
/// messages and logs.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// The transport could not reach the peer.
    #[error("transport failure: {0}")]
    TransportFailure(#[from] TransportError),

    /// The peer did not answer within the delivery timeout.
    #[error("no answer within {0:?}")]
    Timeout(Duration),

    /// The peer answered with a rejection.
    #[error("rejected by peer: {0}")]
    Rejected(String),

    /// The retry budget was used up; the ack was skipped.
    #[error("retry budget exhausted for event {event_id} on {node_id} after {retries} attempts")]
    RetryExhausted {
        /// Event that was given up on.
        event_id: String,
        /// Peer that never acknowledged it.
        node_id: NodeId,
        /// Attempts made.
        retries: u32,
    },
}
