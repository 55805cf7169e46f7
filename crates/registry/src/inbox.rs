//! Receiving side of event distribution.
//!
//! Each node keeps a [`GroupReplica`], its read model of service groups
//! rebuilt from cluster events, and an [`EventInbox`] that applies every
//! event id at most once.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use gatehouse_topology::NodeId;
use gatehouse_transport::{DeliveryHandler, DeliveryOutcome};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::event::later;
use crate::{ClusterEvent, EventPayload, ServiceGroup};

/// How long an applied event id is remembered when the event carries no
/// expire time.
pub const DEFAULT_INBOX_RETENTION: Duration = Duration::from_secs(24 * 60 * 60);

// (tenant, service_group_id)
type GroupKey = (String, String);

#[derive(Debug, Default)]
struct ReplicaState {
    groups: HashMap<GroupKey, ServiceGroup>,
    // Last version of groups that were removed, or deleted before they
    // were seen
    tombstones: HashMap<GroupKey, u64>,
}

impl ReplicaState {
    fn version_of(&self, key: &GroupKey) -> Option<u64> {
        self.groups
            .get(key)
            .map(|group| group.version)
            .or_else(|| self.tombstones.get(key).copied())
    }

    fn is_newer(&self, key: &GroupKey, version: u64) -> bool {
        self.version_of(key).is_none_or(|current| current < version)
    }
}

/// Shared in-memory view of groups built from cluster events
#[derive(Clone, Debug, Default)]
pub struct GroupReplica {
    state: Arc<RwLock<ReplicaState>>,
}

impl GroupReplica {
    /// Creates a new empty replica.
    pub fn new() -> Self {
        Self::default()
    }

    /// The active group named `group_name`, if replicated.
    pub async fn get_group(&self, tenant_id: &str, group_name: &str) -> Option<ServiceGroup> {
        self.state
            .read()
            .await
            .groups
            .values()
            .find(|g| g.tenant_id == tenant_id && g.group_name == group_name && g.active)
            .cloned()
    }

    /// Every replicated group of a tenant, active or not.
    pub async fn list_groups(&self, tenant_id: &str) -> Vec<ServiceGroup> {
        let mut groups: Vec<_> = self
            .state
            .read()
            .await
            .groups
            .values()
            .filter(|g| g.tenant_id == tenant_id)
            .cloned()
            .collect();
        groups.sort_by(|a, b| a.group_name.cmp(&b.group_name));
        groups
    }

    /// Number of replicated groups across tenants.
    pub async fn group_count(&self) -> usize {
        self.state.read().await.groups.len()
    }

    /// Apply one event.
    ///
    /// Every change carries the group version it produced, and a change no
    /// newer than what the replica holds is ignored. Deletions leave their
    /// version behind, so a late update from another source cannot bring a
    /// deleted group back.
    pub async fn apply_event(&self, event: &ClusterEvent) {
        let mut state = self.state.write().await;
        let tenant_id = event.tenant_id().to_string();

        match event.payload() {
            EventPayload::GroupCreated { group } | EventPayload::GroupUpdated { group } => {
                let key = (tenant_id, group.service_group_id.clone());
                if !state.is_newer(&key, group.version) {
                    debug!(
                        service_group_id = %group.service_group_id,
                        version = group.version,
                        "Ignoring stale group change"
                    );
                    return;
                }

                state.tombstones.remove(&key);
                state.groups.insert(key, group.clone());
            }
            EventPayload::GroupDeleted {
                service_group_id,
                version,
                physical,
                ..
            } => {
                let key = (tenant_id, service_group_id.clone());
                if !state.is_newer(&key, *version) {
                    debug!(%service_group_id, version, "Ignoring stale group deletion");
                    return;
                }

                if !*physical && let Some(group) = state.groups.get_mut(&key) {
                    group.active = false;
                    group.version = *version;
                } else {
                    state.groups.remove(&key);
                    state.tombstones.insert(key, *version);
                }
            }
            EventPayload::Opaque {
                event_type,
                event_action,
                ..
            } => {
                debug!(%event_type, %event_action, "Ignoring opaque event");
            }
        }
    }
}

/// Applies delivered events to the local replica, once per event id.
#[derive(Clone, Debug)]
pub struct EventInbox {
    replica: GroupReplica,
    // event id -> time after which it can no longer be redelivered
    applied: Arc<RwLock<HashMap<String, DateTime<Utc>>>>,
    retention: Duration,
}

fn forget_expired(applied: &mut HashMap<String, DateTime<Utc>>, now: DateTime<Utc>) -> usize {
    let before = applied.len();
    applied.retain(|_, forget_at| *forget_at > now);
    before - applied.len()
}

impl EventInbox {
    /// Creates an inbox feeding `replica`.
    pub fn new(replica: GroupReplica) -> Self {
        Self::with_retention(replica, DEFAULT_INBOX_RETENTION)
    }

    /// Creates an inbox that remembers ids of events without an expire
    /// time for `retention` after their creation.
    pub fn with_retention(replica: GroupReplica, retention: Duration) -> Self {
        Self {
            replica,
            applied: Arc::new(RwLock::new(HashMap::new())),
            retention,
        }
    }

    /// The replica this inbox feeds.
    pub const fn replica(&self) -> &GroupReplica {
        &self.replica
    }

    /// Whether `event_id` has been applied.
    pub async fn has_applied(&self, event_id: &str) -> bool {
        self.applied.read().await.contains_key(event_id)
    }

    /// Forget applied ids whose events can no longer be redelivered at
    /// `now`. Returns the number forgotten.
    pub async fn prune(&self, now: DateTime<Utc>) -> usize {
        forget_expired(&mut *self.applied.write().await, now)
    }

    /// Apply `event` unless its id was seen before.
    pub async fn receive(&self, event: &ClusterEvent) -> DeliveryOutcome {
        // Held across the apply so duplicates racing each other serialize
        let mut applied = self.applied.write().await;
        if applied.contains_key(event.event_id()) {
            debug!(event_id = event.event_id(), "Duplicate event acknowledged");
            return DeliveryOutcome::AlreadyApplied;
        }

        let forgotten = forget_expired(&mut applied, Utc::now());
        if forgotten > 0 {
            debug!(forgotten, "Forgot expired event ids");
        }

        self.replica.apply_event(event).await;

        let forget_at = event
            .expire_time()
            .unwrap_or_else(|| later(event.event_time(), self.retention));
        applied.insert(event.event_id().to_string(), forget_at);

        info!(
            event_id = event.event_id(),
            action = event.event_action(),
            "Applied cluster event"
        );
        DeliveryOutcome::Applied
    }
}

#[async_trait]
impl DeliveryHandler for EventInbox {
    async fn handle(&self, sender: &NodeId, event_id: &str, payload: Bytes) -> DeliveryOutcome {
        let event = match ClusterEvent::try_from(payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(%sender, event_id, "Undecodable event: {e}");
                return DeliveryOutcome::Rejected {
                    reason: format!("undecodable event: {e}"),
                };
            }
        };

        if event.event_id() != event_id {
            return DeliveryOutcome::Rejected {
                reason: format!("event id mismatch: {} != {event_id}", event.event_id()),
            };
        }

        self.receive(&event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeSet;

    use chrono::Utc;

    use crate::{DefaultServiceConfig, EventDraft, EventSource, GroupType};

    fn group(version: u64) -> ServiceGroup {
        let now = Utc::now();
        ServiceGroup {
            service_group_id: "GRP20240101000000abcd".to_string(),
            tenant_id: "t1".to_string(),
            group_name: "user-services".to_string(),
            group_type: GroupType::Business,
            description: Some(format!("v{version}")),
            owner_user_id: "admin001".to_string(),
            admin_user_ids: BTreeSet::new(),
            read_user_ids: BTreeSet::new(),
            access_control_enabled: false,
            default_config: DefaultServiceConfig::default(),
            created_at: now,
            created_by: "admin001".to_string(),
            modified_at: now,
            modified_by: "admin001".to_string(),
            version,
            active: true,
        }
    }

    fn event(sequence: u64, payload: EventPayload) -> ClusterEvent {
        ClusterEvent::new(EventDraft {
            sequence,
            tenant_id: "t1".to_string(),
            source_node_id: "node-a:9090".parse().unwrap(),
            source_node_ip: "10.0.0.1".to_string(),
            origin: EventSource::Internal,
            payload,
            event_time: Utc::now(),
            expire_time: None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_duplicate_does_not_alter_state() {
        let inbox = EventInbox::new(GroupReplica::new());
        let created = event(1, EventPayload::GroupCreated { group: group(1) });

        assert_eq!(inbox.receive(&created).await, DeliveryOutcome::Applied);

        // A later update lands, then the create is redelivered
        let updated = event(2, EventPayload::GroupUpdated { group: group(2) });
        inbox.receive(&updated).await;
        assert_eq!(
            inbox.receive(&created).await,
            DeliveryOutcome::AlreadyApplied
        );

        let replicated = inbox.replica().get_group("t1", "user-services").await.unwrap();
        assert_eq!(replicated.version, 2);
        assert_eq!(replicated.description.as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_stale_update_ignored() {
        let replica = GroupReplica::new();
        replica
            .apply_event(&event(2, EventPayload::GroupUpdated { group: group(3) }))
            .await;
        replica
            .apply_event(&event(1, EventPayload::GroupUpdated { group: group(2) }))
            .await;

        let replicated = replica.get_group("t1", "user-services").await.unwrap();
        assert_eq!(replicated.version, 3);
    }

    #[tokio::test]
    async fn test_deletes() {
        let replica = GroupReplica::new();
        replica
            .apply_event(&event(1, EventPayload::GroupCreated { group: group(1) }))
            .await;

        replica
            .apply_event(&event(
                2,
                EventPayload::GroupDeleted {
                    service_group_id: "GRP20240101000000abcd".to_string(),
                    group_name: "user-services".to_string(),
                    version: 2,
                    physical: false,
                },
            ))
            .await;
        assert!(replica.get_group("t1", "user-services").await.is_none());
        assert_eq!(replica.list_groups("t1").await.len(), 1);

        replica
            .apply_event(&event(
                3,
                EventPayload::GroupDeleted {
                    service_group_id: "GRP20240101000000abcd".to_string(),
                    group_name: "user-services".to_string(),
                    version: 3,
                    physical: true,
                },
            ))
            .await;
        assert_eq!(replica.group_count().await, 0);
    }

    fn deleted(version: u64, physical: bool) -> EventPayload {
        EventPayload::GroupDeleted {
            service_group_id: "GRP20240101000000abcd".to_string(),
            group_name: "user-services".to_string(),
            version,
            physical,
        }
    }

    #[tokio::test]
    async fn test_late_update_does_not_revive_deleted_group() {
        let replica = GroupReplica::new();
        replica
            .apply_event(&event(1, EventPayload::GroupCreated { group: group(1) }))
            .await;
        replica.apply_event(&event(3, deleted(3, false))).await;

        // Update from another source, older than the deletion
        replica
            .apply_event(&event(2, EventPayload::GroupUpdated { group: group(2) }))
            .await;

        assert!(replica.get_group("t1", "user-services").await.is_none());
        let groups = replica.list_groups("t1").await;
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].version, 3);
        assert!(!groups[0].active);
    }

    #[tokio::test]
    async fn test_physical_delete_leaves_tombstone() {
        let replica = GroupReplica::new();
        replica
            .apply_event(&event(1, EventPayload::GroupCreated { group: group(1) }))
            .await;
        replica.apply_event(&event(2, deleted(2, true))).await;

        replica
            .apply_event(&event(3, EventPayload::GroupCreated { group: group(1) }))
            .await;
        assert_eq!(replica.group_count().await, 0);

        // Deletion seen before the group itself
        let other = GroupReplica::new();
        other.apply_event(&event(2, deleted(2, false))).await;
        other
            .apply_event(&event(1, EventPayload::GroupCreated { group: group(1) }))
            .await;
        assert!(other.get_group("t1", "user-services").await.is_none());
    }

    #[tokio::test]
    async fn test_applied_ids_forgotten_after_expiry() {
        let inbox = EventInbox::with_retention(GroupReplica::new(), Duration::from_secs(60));
        let now = Utc::now();

        let mut draft = EventDraft {
            sequence: 1,
            tenant_id: "t1".to_string(),
            source_node_id: "node-a:9090".parse().unwrap(),
            source_node_ip: "10.0.0.1".to_string(),
            origin: EventSource::Internal,
            payload: EventPayload::GroupCreated { group: group(1) },
            event_time: now,
            expire_time: Some(now + chrono::TimeDelta::hours(1)),
        };
        let expiring = ClusterEvent::new(draft.clone()).unwrap();
        draft.expire_time = None;
        let lasting = ClusterEvent::new(draft).unwrap();

        inbox.receive(&expiring).await;
        inbox.receive(&lasting).await;

        // Retention of 60s applies to the event without an expire time
        assert_eq!(inbox.prune(now + chrono::TimeDelta::minutes(2)).await, 1);
        assert!(inbox.has_applied(expiring.event_id()).await);
        assert!(!inbox.has_applied(lasting.event_id()).await);

        assert_eq!(inbox.prune(now + chrono::TimeDelta::hours(2)).await, 1);
        assert!(!inbox.has_applied(expiring.event_id()).await);
    }

    #[tokio::test]
    async fn test_handler_rejects_garbage() {
        let inbox = EventInbox::new(GroupReplica::new());
        let sender: NodeId = "node-a:9090".parse().unwrap();

        let outcome = inbox
            .handle(&sender, "EVT1", Bytes::from_static(b"not cbor"))
            .await;
        assert!(matches!(outcome, DeliveryOutcome::Rejected { .. }));

        let created = event(1, EventPayload::GroupCreated { group: group(1) });
        let payload: Bytes = created.clone().try_into().unwrap();
        assert_eq!(
            inbox.handle(&sender, created.event_id(), payload).await,
            DeliveryOutcome::Applied
        );
        assert!(inbox.has_applied(created.event_id()).await);
    }
}
