//! Atomic write batches

use bytes::Bytes;

use crate::StorageNamespace;

/// Condition a key must satisfy for its batch to apply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Precondition {
    /// No condition
    None,
    /// The key must not exist
    Absent,
    /// The key must exist, at any revision
    Exists,
    /// The key must exist at exactly this revision
    Revision(u64),
}

impl Precondition {
    /// Whether a key currently at `current` revision (`None` when absent)
    /// satisfies this precondition
    pub const fn holds(self, current: Option<u64>) -> bool {
        match (self, current) {
            (Self::None, _) | (Self::Absent, None) | (Self::Exists, Some(_)) => true,
            (Self::Revision(expected), Some(revision)) => expected == revision,
            _ => false,
        }
    }
}

/// A single write within a batch.
#[derive(Clone, Debug)]
pub enum WriteOp {
    /// Write a value
    Put {
        /// Target namespace
        namespace: StorageNamespace,
        /// Target key
        key: String,
        /// New value
        value: Bytes,
        /// Condition on the current state of the key
        precondition: Precondition,
    },

    /// Remove a key
    Delete {
        /// Target namespace
        namespace: StorageNamespace,
        /// Target key
        key: String,
        /// Condition on the current state of the key
        precondition: Precondition,
    },
}

impl WriteOp {
    /// Namespace this operation targets
    pub const fn namespace(&self) -> &StorageNamespace {
        match self {
            Self::Put { namespace, .. } | Self::Delete { namespace, .. } => namespace,
        }
    }

    /// Key this operation targets
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key, .. } => key,
        }
    }

    /// Precondition of this operation
    pub const fn precondition(&self) -> Precondition {
        match self {
            Self::Put { precondition, .. } | Self::Delete { precondition, .. } => *precondition,
        }
    }
}

/// Ordered set of writes committed atomically.
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    /// Create an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a put
    pub fn put(
        &mut self,
        namespace: &StorageNamespace,
        key: impl Into<String>,
        value: impl Into<Bytes>,
        precondition: Precondition,
    ) -> &mut Self {
        self.ops.push(WriteOp::Put {
            namespace: namespace.clone(),
            key: key.into(),
            value: value.into(),
            precondition,
        });
        self
    }

    /// Stage a delete
    pub fn delete(
        &mut self,
        namespace: &StorageNamespace,
        key: impl Into<String>,
        precondition: Precondition,
    ) -> &mut Self {
        self.ops.push(WriteOp::Delete {
            namespace: namespace.clone(),
            key: key.into(),
            precondition,
        });
        self
    }

    /// Whether any operation touches `namespace`
    pub fn touches(&self, namespace: &StorageNamespace) -> bool {
        self.ops.iter().any(|op| op.namespace() == namespace)
    }

    /// Number of staged operations
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the batch is empty
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Staged operations in order
    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    /// Consume the batch
    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_precondition_holds() {
        assert!(Precondition::None.holds(None));
        assert!(Precondition::None.holds(Some(3)));
        assert!(Precondition::Absent.holds(None));
        assert!(!Precondition::Absent.holds(Some(1)));
        assert!(Precondition::Exists.holds(Some(1)));
        assert!(!Precondition::Exists.holds(None));
        assert!(Precondition::Revision(2).holds(Some(2)));
        assert!(!Precondition::Revision(2).holds(Some(3)));
        assert!(!Precondition::Revision(2).holds(None));
    }

    #[test]
    fn test_batch_touches_namespace() {
        let groups = StorageNamespace::new("groups");
        let events = StorageNamespace::new("events");

        let mut batch = WriteBatch::new();
        batch.put(&groups, "t1/GRP1", Bytes::from_static(b"x"), Precondition::Absent);

        assert_eq!(batch.len(), 1);
        assert!(batch.touches(&groups));
        assert!(!batch.touches(&events));
    }
}
