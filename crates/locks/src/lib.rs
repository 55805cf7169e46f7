//! Abstract interface for keyed mutual exclusion.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::error::Error;
use std::fmt::Debug;

use async_trait::async_trait;

/// Marker trait for `LockManager` errors
pub trait LockManagerError: Debug + Error + Send + Sync + 'static {}

/// Represents the current status of a lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    /// The lock is free.
    Free,

    /// A guard for the lock is alive.
    Held,
}

/// A lock manager handing out guards for named resources. Unrelated
/// resources never contend with each other; the lock is released when the
/// guard is dropped.
#[async_trait]
pub trait LockManager: Send + Sync + 'static {
    /// The error type for lock operations.
    type Error: LockManagerError;

    /// The guard type that releases the lock on drop.
    type Guard: Send + Sync + 'static;

    /// Checks the status of a lock.
    async fn check(&self, resource_id: String) -> Result<LockStatus, Self::Error>;

    /// Acquire a lock, waiting until it becomes available.
    async fn lock(&self, resource_id: String) -> Result<Self::Guard, Self::Error>;

    /// Attempt to acquire a lock without waiting.
    ///
    /// Returns `Ok(None)` if the lock is currently held.
    async fn try_lock(&self, resource_id: String) -> Result<Option<Self::Guard>, Self::Error>;
}

/// A lock manager that can be narrowed to a scope (e.g. a tenant), so
/// identical resource ids in different scopes are independent locks.
pub trait ScopedLockManager
where
    Self: Clone + Send + Sync + 'static,
{
    /// The error type for the lock manager.
    type Error: LockManagerError;

    /// The scoped lock manager type.
    type Scoped: LockManager<Error = Self::Error>;

    /// Creates a scoped lock manager.
    fn scope<S>(&self, scope: S) -> Self::Scoped
    where
        S: AsRef<str> + Send;
}
