//! In-memory keyed storage implementation

use async_trait::async_trait;
use gatehouse_storage::{
    KeyValueStorage, StorageError, StorageNamespace, StorageResult, VersionedValue, WriteBatch,
    WriteOp,
};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[derive(Default)]
struct State {
    /// namespace -> (key -> value)
    tables: HashMap<StorageNamespace, BTreeMap<String, VersionedValue>>,
    /// namespace -> last handed out sequence
    sequences: HashMap<StorageNamespace, u64>,
    /// Commits touching these namespaces fail with `Unavailable`
    failing: HashSet<StorageNamespace>,
}

impl State {
    fn revision_of(&self, namespace: &StorageNamespace, key: &str) -> Option<u64> {
        self.tables
            .get(namespace)
            .and_then(|table| table.get(key))
            .map(|entry| entry.revision)
    }
}

/// In-memory storage using one `BTreeMap` per namespace for ordered scans
#[derive(Clone, Default)]
pub struct MemoryStorage {
    state: Arc<RwLock<State>>,
}

impl MemoryStorage {
    /// Create a new in-memory storage instance
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every commit touching `namespace` fail until cleared.
    pub async fn fail_writes_to(&self, namespace: &StorageNamespace) {
        self.state.write().await.failing.insert(namespace.clone());
    }

    /// Undo [`Self::fail_writes_to`] for all namespaces.
    pub async fn clear_write_failures(&self) {
        self.state.write().await.failing.clear();
    }

    /// Number of keys stored in `namespace`
    pub async fn len(&self, namespace: &StorageNamespace) -> usize {
        self.state
            .read()
            .await
            .tables
            .get(namespace)
            .map_or(0, BTreeMap::len)
    }
}

#[async_trait]
impl KeyValueStorage for MemoryStorage {
    async fn get(
        &self,
        namespace: &StorageNamespace,
        key: &str,
    ) -> StorageResult<Option<VersionedValue>> {
        let state = self.state.read().await;

        Ok(state
            .tables
            .get(namespace)
            .and_then(|table| table.get(key))
            .cloned())
    }

    async fn scan_prefix(
        &self,
        namespace: &StorageNamespace,
        prefix: &str,
    ) -> StorageResult<Vec<(String, VersionedValue)>> {
        let state = self.state.read().await;

        let Some(table) = state.tables.get(namespace) else {
            return Ok(Vec::new());
        };

        Ok(table
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn commit(&self, batch: WriteBatch) -> StorageResult<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut state = self.state.write().await;

        if let Some(op) = batch
            .ops()
            .iter()
            .find(|op| state.failing.contains(op.namespace()))
        {
            warn!(namespace = %op.namespace(), "Rejecting commit to failing namespace");
            return Err(StorageError::Unavailable(format!(
                "writes to {} are failing",
                op.namespace()
            )));
        }

        // Check every precondition before touching anything
        for op in batch.ops() {
            if op.key().is_empty() {
                return Err(StorageError::InvalidKey("empty key".to_string()));
            }

            let current = state.revision_of(op.namespace(), op.key());
            if !op.precondition().holds(current) {
                debug!(
                    namespace = %op.namespace(),
                    key = op.key(),
                    ?current,
                    precondition = ?op.precondition(),
                    "Batch precondition failed"
                );
                return Err(StorageError::PreconditionFailed {
                    namespace: op.namespace().clone(),
                    key: op.key().to_string(),
                });
            }
        }

        for op in batch.into_ops() {
            match op {
                WriteOp::Put {
                    namespace,
                    key,
                    value,
                    ..
                } => {
                    let table = state.tables.entry(namespace).or_default();
                    let revision = table.get(&key).map_or(0, |entry| entry.revision) + 1;
                    table.insert(key, VersionedValue { value, revision });
                }
                WriteOp::Delete { namespace, key, .. } => {
                    if let Some(table) = state.tables.get_mut(&namespace) {
                        table.remove(&key);
                    }
                }
            }
        }

        Ok(())
    }

    async fn next_sequence(&self, namespace: &StorageNamespace) -> StorageResult<u64> {
        let mut state = self.state.write().await;
        let sequence = state.sequences.entry(namespace.clone()).or_insert(0);
        *sequence += 1;

        Ok(*sequence)
    }
}

impl std::fmt::Debug for MemoryStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("state", &"<locked>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use bytes::Bytes;
    use gatehouse_storage::Precondition;

    fn value(data: &'static str) -> Bytes {
        Bytes::from_static(data.as_bytes())
    }

    #[tokio::test]
    async fn test_put_and_get() {
        let storage = MemoryStorage::new();
        let namespace = StorageNamespace::new("test");

        let mut batch = WriteBatch::new();
        batch.put(&namespace, "a", value("data 1"), Precondition::Absent);
        storage.commit(batch).await.unwrap();

        let stored = storage.get(&namespace, "a").await.unwrap().unwrap();
        assert_eq!(stored.value, Bytes::from("data 1"));
        assert_eq!(stored.revision, 1);

        let mut batch = WriteBatch::new();
        batch.put(&namespace, "a", value("data 2"), Precondition::Revision(1));
        storage.commit(batch).await.unwrap();

        let stored = storage.get(&namespace, "a").await.unwrap().unwrap();
        assert_eq!(stored.value, Bytes::from("data 2"));
        assert_eq!(stored.revision, 2);
    }

    #[tokio::test]
    async fn test_failed_precondition_applies_nothing() {
        let storage = MemoryStorage::new();
        let namespace = StorageNamespace::new("test");

        let mut batch = WriteBatch::new();
        batch.put(&namespace, "taken", value("first"), Precondition::Absent);
        storage.commit(batch).await.unwrap();

        let mut batch = WriteBatch::new();
        batch
            .put(&namespace, "fresh", value("second"), Precondition::Absent)
            .put(&namespace, "taken", value("second"), Precondition::Absent);

        assert_matches!(
            storage.commit(batch).await,
            Err(StorageError::PreconditionFailed { key, .. }) if key == "taken"
        );
        assert!(storage.get(&namespace, "fresh").await.unwrap().is_none());
        assert_eq!(storage.len(&namespace).await, 1);
    }

    #[tokio::test]
    async fn test_stale_revision_rejected() {
        let storage = MemoryStorage::new();
        let namespace = StorageNamespace::new("test");

        let mut batch = WriteBatch::new();
        batch.put(&namespace, "a", value("v1"), Precondition::None);
        storage.commit(batch).await.unwrap();

        let mut batch = WriteBatch::new();
        batch.put(&namespace, "a", value("v2"), Precondition::Revision(1));
        storage.commit(batch).await.unwrap();

        let mut batch = WriteBatch::new();
        batch.put(&namespace, "a", value("v3"), Precondition::Revision(1));
        assert_matches!(
            storage.commit(batch).await,
            Err(StorageError::PreconditionFailed { .. })
        );
    }

    #[tokio::test]
    async fn test_scan_prefix_in_key_order() {
        let storage = MemoryStorage::new();
        let namespace = StorageNamespace::new("test");

        let mut batch = WriteBatch::new();
        batch
            .put(&namespace, "t2/b", value("x"), Precondition::None)
            .put(&namespace, "t1/b", value("b"), Precondition::None)
            .put(&namespace, "t1/a", value("a"), Precondition::None);
        storage.commit(batch).await.unwrap();

        let keys: Vec<_> = storage
            .scan_prefix(&namespace, "t1/")
            .await
            .unwrap()
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(keys, vec!["t1/a".to_string(), "t1/b".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_resets_revision() {
        let storage = MemoryStorage::new();
        let namespace = StorageNamespace::new("test");

        let mut batch = WriteBatch::new();
        batch.put(&namespace, "a", value("v1"), Precondition::None);
        storage.commit(batch).await.unwrap();

        let mut batch = WriteBatch::new();
        batch.delete(&namespace, "a", Precondition::Exists);
        storage.commit(batch).await.unwrap();
        assert!(storage.get(&namespace, "a").await.unwrap().is_none());

        let mut batch = WriteBatch::new();
        batch.put(&namespace, "a", value("v2"), Precondition::Absent);
        storage.commit(batch).await.unwrap();
        assert_eq!(storage.get(&namespace, "a").await.unwrap().unwrap().revision, 1);
    }

    #[tokio::test]
    async fn test_sequences_per_namespace() {
        let storage = MemoryStorage::new();
        let events = StorageNamespace::new("events");
        let other = StorageNamespace::new("other");

        assert_eq!(storage.next_sequence(&events).await.unwrap(), 1);
        assert_eq!(storage.next_sequence(&events).await.unwrap(), 2);
        assert_eq!(storage.next_sequence(&other).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failing_namespace() {
        let storage = MemoryStorage::new();
        let groups = StorageNamespace::new("groups");
        let events = StorageNamespace::new("events");

        storage.fail_writes_to(&events).await;

        let mut batch = WriteBatch::new();
        batch
            .put(&groups, "g", value("group"), Precondition::Absent)
            .put(&events, "e", value("event"), Precondition::Absent);
        assert_matches!(
            storage.commit(batch).await,
            Err(StorageError::Unavailable(_))
        );
        assert_eq!(storage.len(&groups).await, 0);

        storage.clear_write_failures().await;
        let mut batch = WriteBatch::new();
        batch.put(&events, "e", value("event"), Precondition::Absent);
        storage.commit(batch).await.unwrap();
    }
}
