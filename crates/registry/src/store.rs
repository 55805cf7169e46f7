//! Typed repositories over [`KeyValueStorage`].
//!
//! Records are CBOR encoded. Key layout:
//! - `service-groups`: `{tenant}/{service_group_id}` -> `ServiceGroup`
//! - `service-group-names`: `{tenant}/{group_name}` -> id of the active group
//! - `cluster-events`: `{event_id}` -> `ClusterEvent`
//! - `cluster-event-acks`: `{event_id}/{node_id}` -> `ClusterEventAck`
//!
//! A group's `version` always equals the revision of its record, so the
//! version check of an update is a revision precondition on the record.

use std::sync::LazyLock;

use bytes::Bytes;
use gatehouse_storage::{
    KeyValueStorage, Precondition, StorageError, StorageNamespace, WriteBatch,
};
use gatehouse_topology::NodeId;
use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, instrument};

use crate::{AckStatus, ClusterEvent, ClusterEventAck, Error, Result, ServiceGroup};

/// Namespace of group records.
pub static GROUPS: LazyLock<StorageNamespace> =
    LazyLock::new(|| StorageNamespace::new("service-groups"));
/// Namespace of the active-name index.
pub static GROUP_NAMES: LazyLock<StorageNamespace> =
    LazyLock::new(|| StorageNamespace::new("service-group-names"));
/// Namespace of cluster events.
pub static EVENTS: LazyLock<StorageNamespace> =
    LazyLock::new(|| StorageNamespace::new("cluster-events"));
/// Namespace of acks.
pub static ACKS: LazyLock<StorageNamespace> =
    LazyLock::new(|| StorageNamespace::new("cluster-event-acks"));

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
    let mut writer = Vec::new();
    ciborium::ser::into_writer(value, &mut writer).map_err(|e| Error::Codec(e.to_string()))?;
    Ok(Bytes::from(writer))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &Bytes) -> Result<T> {
    ciborium::de::from_reader(bytes.as_ref()).map_err(|e| Error::Codec(e.to_string()))
}

/// A record together with the store revision it was read at.
#[derive(Clone, Debug)]
pub struct Stored<T> {
    /// The record.
    pub value: T,
    /// Revision of its key.
    pub revision: u64,
}

fn group_key(tenant_id: &str, service_group_id: &str) -> String {
    format!("{tenant_id}/{service_group_id}")
}

fn name_key(tenant_id: &str, group_name: &str) -> String {
    format!("{tenant_id}/{group_name}")
}

fn ack_key(event_id: &str, node_id: &NodeId) -> String {
    format!("{event_id}/{node_id}")
}

/// Persistence of service groups and the active-name index.
#[derive(Clone, Debug)]
pub struct GroupStore<S> {
    storage: S,
}

impl<S: KeyValueStorage> GroupStore<S> {
    /// Wrap a storage backend.
    pub const fn new(storage: S) -> Self {
        Self { storage }
    }

    /// The active group named `group_name`, if any.
    pub async fn get_active(&self, tenant_id: &str, group_name: &str) -> Result<Option<ServiceGroup>> {
        let Some(index) = self
            .storage
            .get(&GROUP_NAMES, &name_key(tenant_id, group_name))
            .await?
        else {
            return Ok(None);
        };

        let service_group_id: String = decode(&index.value)?;
        let Some(record) = self
            .storage
            .get(&GROUPS, &group_key(tenant_id, &service_group_id))
            .await?
        else {
            return Ok(None);
        };

        let group: ServiceGroup = decode(&record.value)?;
        Ok(group.active.then_some(group))
    }

    /// The most recently modified group named `group_name`, active or not.
    pub async fn get_any(&self, tenant_id: &str, group_name: &str) -> Result<Option<ServiceGroup>> {
        if let Some(group) = self.get_active(tenant_id, group_name).await? {
            return Ok(Some(group));
        }

        Ok(self
            .list(tenant_id)
            .await?
            .into_iter()
            .filter(|group| group.group_name == group_name)
            .max_by_key(|group| group.modified_at))
    }

    /// Every group of `tenant_id`, active or not, ordered by name then id.
    pub async fn list(&self, tenant_id: &str) -> Result<Vec<ServiceGroup>> {
        let mut groups = self
            .storage
            .scan_prefix(&GROUPS, &format!("{tenant_id}/"))
            .await?
            .iter()
            .map(|(_, record)| decode::<ServiceGroup>(&record.value))
            .collect::<Result<Vec<_>>>()?;

        groups.sort_by(|a, b| {
            a.group_name
                .cmp(&b.group_name)
                .then_with(|| a.service_group_id.cmp(&b.service_group_id))
        });

        Ok(groups)
    }

    /// Stage the insertion of a new group; fails at commit if the name is taken.
    pub fn stage_insert(&self, batch: &mut WriteBatch, group: &ServiceGroup) -> Result<()> {
        batch
            .put(
                &GROUP_NAMES,
                name_key(&group.tenant_id, &group.group_name),
                encode(&group.service_group_id)?,
                Precondition::Absent,
            )
            .put(
                &GROUPS,
                group_key(&group.tenant_id, &group.service_group_id),
                encode(group)?,
                Precondition::Absent,
            );
        Ok(())
    }

    /// Stage replacing the record read at `previous_version` with `group`.
    ///
    /// Deactivated groups also lose their name index entry.
    pub fn stage_replace(
        &self,
        batch: &mut WriteBatch,
        group: &ServiceGroup,
        previous_version: u64,
    ) -> Result<()> {
        batch.put(
            &GROUPS,
            group_key(&group.tenant_id, &group.service_group_id),
            encode(group)?,
            Precondition::Revision(previous_version),
        );

        if !group.active {
            batch.delete(
                &GROUP_NAMES,
                name_key(&group.tenant_id, &group.group_name),
                Precondition::Exists,
            );
        }

        Ok(())
    }

    /// Stage removing `group` entirely.
    pub fn stage_remove(&self, batch: &mut WriteBatch, group: &ServiceGroup) {
        batch
            .delete(
                &GROUPS,
                group_key(&group.tenant_id, &group.service_group_id),
                Precondition::Revision(group.version),
            )
            .delete(
                &GROUP_NAMES,
                name_key(&group.tenant_id, &group.group_name),
                Precondition::Exists,
            );
    }
}

/// Persistence of cluster events and their acks.
#[derive(Clone, Debug)]
pub struct EventLogStore<S> {
    storage: S,
}

impl<S: KeyValueStorage> EventLogStore<S> {
    /// Wrap a storage backend.
    pub const fn new(storage: S) -> Self {
        Self { storage }
    }

    /// Reserve the log position of the next event.
    pub async fn next_sequence(&self) -> Result<u64> {
        Ok(self.storage.next_sequence(&EVENTS).await?)
    }

    /// Stage appending `event`.
    pub fn stage_append(&self, batch: &mut WriteBatch, event: &ClusterEvent) -> Result<()> {
        batch.put(&EVENTS, event.event_id(), encode(event)?, Precondition::Absent);
        Ok(())
    }

    /// A single event.
    pub async fn get_event(&self, event_id: &str) -> Result<Option<ClusterEvent>> {
        self.storage
            .get(&EVENTS, event_id)
            .await?
            .map(|record| decode(&record.value))
            .transpose()
    }

    /// Every event, optionally narrowed to a tenant, in append order.
    pub async fn list_events(&self, tenant_id: Option<&str>) -> Result<Vec<ClusterEvent>> {
        let mut events = self
            .storage
            .scan_prefix(&EVENTS, "")
            .await?
            .iter()
            .map(|(_, record)| decode::<ClusterEvent>(&record.value))
            .collect::<Result<Vec<_>>>()?;

        if let Some(tenant_id) = tenant_id {
            events.retain(|event| event.tenant_id() == tenant_id);
        }
        events.sort_by_key(ClusterEvent::sequence);
        Ok(events)
    }

    /// Insert `ack` unless one exists for its (event, node) pair.
    ///
    /// Returns whether this call created it; creation is the claim to
    /// dispatch the event to that node.
    #[instrument(skip(self, ack), fields(event_id = %ack.event_id, node_id = %ack.node_id))]
    pub async fn claim_ack(&self, ack: &ClusterEventAck) -> Result<bool> {
        let mut batch = WriteBatch::new();
        batch.put(
            &ACKS,
            ack_key(&ack.event_id, &ack.node_id),
            encode(ack)?,
            Precondition::Absent,
        );

        match self.storage.commit(batch).await {
            Ok(()) => Ok(true),
            Err(StorageError::PreconditionFailed { .. }) => {
                debug!("Ack already claimed");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The ack of `event_id` on `node_id`.
    pub async fn get_ack(
        &self,
        event_id: &str,
        node_id: &NodeId,
    ) -> Result<Option<Stored<ClusterEventAck>>> {
        self.storage
            .get(&ACKS, &ack_key(event_id, node_id))
            .await?
            .map(|record| {
                Ok(Stored {
                    value: decode(&record.value)?,
                    revision: record.revision,
                })
            })
            .transpose()
    }

    /// Acks of one event.
    pub async fn list_acks(&self, event_id: &str) -> Result<Vec<Stored<ClusterEventAck>>> {
        self.scan_acks(&format!("{event_id}/")).await
    }

    /// Acks of every event.
    pub async fn list_all_acks(&self) -> Result<Vec<Stored<ClusterEventAck>>> {
        self.scan_acks("").await
    }

    async fn scan_acks(&self, prefix: &str) -> Result<Vec<Stored<ClusterEventAck>>> {
        self.storage
            .scan_prefix(&ACKS, prefix)
            .await?
            .iter()
            .map(|(_, record)| {
                Ok(Stored {
                    value: decode(&record.value)?,
                    revision: record.revision,
                })
            })
            .collect()
    }

    /// Replace `current` with `next`, enforcing the ack state machine.
    ///
    /// Returns `false` if the ack changed since `current` was read, in which
    /// case nothing was written.
    #[instrument(skip_all, fields(event_id = %next.event_id, node_id = %next.node_id, from = %current.value.status, to = %next.status))]
    pub async fn transition_ack(
        &self,
        current: &Stored<ClusterEventAck>,
        next: &ClusterEventAck,
    ) -> Result<bool> {
        let from: AckStatus = current.value.status;
        if !from.can_transition_to(next.status) {
            return Err(Error::InvalidTransition {
                from,
                to: next.status,
            });
        }

        let mut batch = WriteBatch::new();
        batch.put(
            &ACKS,
            ack_key(&next.event_id, &next.node_id),
            encode(next)?,
            Precondition::Revision(current.revision),
        );

        match self.storage.commit(batch).await {
            Ok(()) => Ok(true),
            Err(StorageError::PreconditionFailed { .. }) => {
                debug!("Ack changed concurrently");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove an event together with all of its acks.
    pub async fn delete_event(&self, event_id: &str) -> Result<usize> {
        let acks = self.storage.scan_prefix(&ACKS, &format!("{event_id}/")).await?;

        let mut batch = WriteBatch::new();
        batch.delete(&EVENTS, event_id, Precondition::None);
        for (key, _) in &acks {
            batch.delete(&ACKS, key.clone(), Precondition::None);
        }

        self.storage.commit(batch).await?;
        Ok(acks.len())
    }
}
