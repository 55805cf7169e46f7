//! Storage traits for the gateway registry
//!
//! Backends store opaque byte values under string keys grouped into
//! namespaces. Every key carries a revision so callers can build optimistic
//! concurrency on top, and writes go through atomic batches guarded by
//! per-key preconditions.

pub mod batch;
pub mod kv;

// Re-export the essential types
pub use batch::{Precondition, WriteBatch, WriteOp};
pub use kv::{
    KeyValueStorage, PageRequest, StorageError, StorageNamespace, StorageResult, VersionedValue,
};
