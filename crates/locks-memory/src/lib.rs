//! In-memory (single node) keyed locks.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use gatehouse_locks::{LockManager, LockStatus, ScopedLockManager};
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

type LockTable = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// In-memory lock manager with one async mutex per resource key.
#[derive(Clone, Debug, Default)]
pub struct MemoryLockManager {
    table: LockTable,
    prefix: Option<String>,
}

/// Guard for a held in-memory lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct MemoryLockGuard {
    key: String,
    table: LockTable,
    guard: Option<OwnedMutexGuard<()>>,
}

impl MemoryLockGuard {
    /// The fully scoped key this guard holds.
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for MemoryLockGuard {
    fn drop(&mut self) {
        drop(self.guard.take());

        // Forget the entry once nobody else holds or waits on it.
        let mut table = self.table.lock();
        if table
            .get(&self.key)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            table.remove(&self.key);
        }

        trace!(key = %self.key, "Released lock");
    }
}

impl MemoryLockManager {
    /// Creates a new instance of `MemoryLockManager`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
            prefix: None,
        }
    }

    fn get_key(&self, key: String) -> Result<String, Error> {
        if key.is_empty() {
            return Err(Error::EmptyResourceId);
        }

        Ok(match &self.prefix {
            Some(prefix) => format!("{prefix}:{key}"),
            None => key,
        })
    }

    fn entry(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut table = self.table.lock();
        Arc::clone(
            table
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
        )
    }

    /// Number of keys currently held or awaited.
    #[must_use]
    pub fn active_keys(&self) -> usize {
        self.table.lock().len()
    }
}

#[async_trait]
impl LockManager for MemoryLockManager {
    type Error = Error;
    type Guard = MemoryLockGuard;

    async fn check(&self, resource_id: String) -> Result<LockStatus, Self::Error> {
        let key = self.get_key(resource_id)?;

        let held = self
            .table
            .lock()
            .get(&key)
            .is_some_and(|entry| entry.try_lock().is_err());

        Ok(if held {
            LockStatus::Held
        } else {
            LockStatus::Free
        })
    }

    async fn lock(&self, resource_id: String) -> Result<Self::Guard, Self::Error> {
        let key = self.get_key(resource_id)?;
        let guard = self.entry(&key).lock_owned().await;

        trace!(key = %key, "Acquired lock");

        Ok(MemoryLockGuard {
            key,
            table: Arc::clone(&self.table),
            guard: Some(guard),
        })
    }

    async fn try_lock(&self, resource_id: String) -> Result<Option<Self::Guard>, Self::Error> {
        let key = self.get_key(resource_id)?;

        let Ok(guard) = self.entry(&key).try_lock_owned() else {
            return Ok(None);
        };

        Ok(Some(MemoryLockGuard {
            key,
            table: Arc::clone(&self.table),
            guard: Some(guard),
        }))
    }
}

impl ScopedLockManager for MemoryLockManager {
    type Error = Error;
    type Scoped = Self;

    fn scope<S>(&self, scope: S) -> Self::Scoped
    where
        S: AsRef<str> + Send,
    {
        let new_scope = match &self.prefix {
            Some(existing_scope) => format!("{existing_scope}:{}", scope.as_ref()),
            None => scope.as_ref().to_string(),
        };

        Self {
            table: Arc::clone(&self.table),
            prefix: Some(new_scope),
        }
    }
}
