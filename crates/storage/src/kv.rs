//! Keyed storage abstraction with revisions

use std::fmt::{Debug, Display};

use async_trait::async_trait;
use bytes::Bytes;

use crate::WriteBatch;

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur in storage operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StorageError {
    /// Storage backend error
    #[error("Storage backend error: {0}")]
    Backend(String),

    /// Invalid key format
    #[error("Invalid key format: {0}")]
    InvalidKey(String),

    /// A batch precondition did not hold; nothing in the batch was applied
    #[error("Precondition failed for {namespace}/{key}")]
    PreconditionFailed {
        /// Namespace of the offending key
        namespace: StorageNamespace,
        /// The offending key
        key: String,
    },

    /// Backend is shutting down or otherwise unreachable
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// A namespace for organizing data
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageNamespace(String);

impl StorageNamespace {
    /// Create a new storage namespace
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Get the namespace as a string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for StorageNamespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stored value together with its revision.
///
/// Revisions start at 1 when a key is first written and increase by one on
/// every later put. Deleting a key resets it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionedValue {
    /// The raw value
    pub value: Bytes,
    /// Revision of the key when this value was read
    pub revision: u64,
}

/// Offset/limit window for paginated reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageRequest {
    /// Number of items to skip
    pub offset: usize,
    /// Maximum number of items to return
    pub limit: usize,
}

impl PageRequest {
    /// Page `number` (1-based) of `size` items
    pub const fn page(number: usize, size: usize) -> Self {
        Self {
            offset: number.saturating_sub(1).saturating_mul(size),
            limit: size,
        }
    }
}

impl Default for PageRequest {
    fn default() -> Self {
        Self::page(1, 20)
    }
}

/// Keyed storage with revisions and atomic conditional batches.
#[async_trait]
pub trait KeyValueStorage: Clone + Debug + Send + Sync + 'static {
    /// Read a single key
    async fn get(
        &self,
        namespace: &StorageNamespace,
        key: &str,
    ) -> StorageResult<Option<VersionedValue>>;

    /// Read every key starting with `prefix`, in key order
    async fn scan_prefix(
        &self,
        namespace: &StorageNamespace,
        prefix: &str,
    ) -> StorageResult<Vec<(String, VersionedValue)>>;

    /// Apply every operation in `batch` or none of them.
    ///
    /// Fails with [`StorageError::PreconditionFailed`] naming the first key
    /// whose precondition does not hold.
    async fn commit(&self, batch: WriteBatch) -> StorageResult<()>;

    /// Next value of a monotonically increasing counter for `namespace`,
    /// starting at 1. Values are never handed out twice, even if the batch
    /// they were meant for later fails.
    async fn next_sequence(&self, namespace: &StorageNamespace) -> StorageResult<u64>;
}
