use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use gatehouse_topology::NodeId;
use serde::{Deserialize, Serialize};

use crate::{Error, EventSource, Result, ServiceGroup, ids};

/// `at` shifted forward by `by`, saturating at `at` if out of range.
pub(crate) fn later(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(by)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(at)
}

/// Event type of every service group event.
pub const SERVICE_GROUP_EVENT: &str = "SERVICE_GROUP";

/// Typed body of a cluster event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventPayload {
    /// A group was registered.
    GroupCreated {
        /// The group as created.
        group: ServiceGroup,
    },

    /// A group was updated.
    GroupUpdated {
        /// The group after the update.
        group: ServiceGroup,
    },

    /// A group was deleted.
    GroupDeleted {
        /// Id of the deleted group.
        service_group_id: String,
        /// Name of the deleted group.
        group_name: String,
        /// Group version the deletion produced.
        version: u64,
        /// Whether the record was removed rather than deactivated.
        physical: bool,
    },

    /// An event kind this node does not model; carried through untouched.
    Opaque {
        /// Event type as reported by the producer.
        event_type: String,
        /// Event action as reported by the producer.
        event_action: String,
        /// Raw body.
        data: Bytes,
    },
}

impl EventPayload {
    /// The `eventType` label of this payload.
    pub fn event_type(&self) -> &str {
        match self {
            Self::GroupCreated { .. } | Self::GroupUpdated { .. } | Self::GroupDeleted { .. } => {
                SERVICE_GROUP_EVENT
            }
            Self::Opaque { event_type, .. } => event_type,
        }
    }

    /// The `eventAction` label of this payload.
    pub fn event_action(&self) -> &str {
        match self {
            Self::GroupCreated { .. } => "CREATE",
            Self::GroupUpdated { .. } => "UPDATE",
            Self::GroupDeleted { .. } => "DELETE",
            Self::Opaque { event_action, .. } => event_action,
        }
    }

    /// Id of the group this payload is about, if any.
    pub fn service_group_id(&self) -> Option<&str> {
        match self {
            Self::GroupCreated { group } | Self::GroupUpdated { group } => {
                Some(&group.service_group_id)
            }
            Self::GroupDeleted {
                service_group_id, ..
            } => Some(service_group_id),
            Self::Opaque { .. } => None,
        }
    }
}

/// One state change to propagate to peers. Immutable once built.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEvent {
    event_id: String,
    sequence: u64,
    tenant_id: String,
    source_node_id: NodeId,
    source_node_ip: String,
    origin: EventSource,
    payload: EventPayload,
    event_time: DateTime<Utc>,
    expire_time: Option<DateTime<Utc>>,
}

/// Fields needed to build a [`ClusterEvent`].
#[derive(Clone, Debug)]
pub struct EventDraft {
    /// Log position assigned by the store.
    pub sequence: u64,
    /// Owning tenant.
    pub tenant_id: String,
    /// Node that produced the event.
    pub source_node_id: NodeId,
    /// Address of the producing node.
    pub source_node_ip: String,
    /// Origin of the request behind the event.
    pub origin: EventSource,
    /// Typed body.
    pub payload: EventPayload,
    /// Creation time.
    pub event_time: DateTime<Utc>,
    /// Time after which delivery is abandoned.
    pub expire_time: Option<DateTime<Utc>>,
}

impl ClusterEvent {
    /// Build an event with a fresh id.
    ///
    /// Fails if `expire_time` precedes `event_time`.
    pub fn new(draft: EventDraft) -> Result<Self> {
        if draft.expire_time.is_some_and(|expire| expire < draft.event_time) {
            return Err(Error::InvalidArgument(
                "event expire time precedes event time".to_string(),
            ));
        }

        Ok(Self {
            event_id: ids::generate(ids::EVENT_ID_PREFIX, draft.event_time),
            sequence: draft.sequence,
            tenant_id: draft.tenant_id,
            source_node_id: draft.source_node_id,
            source_node_ip: draft.source_node_ip,
            origin: draft.origin,
            payload: draft.payload,
            event_time: draft.event_time,
            expire_time: draft.expire_time,
        })
    }

    /// Globally unique id.
    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    /// Append position; orders events from the same source node.
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Owning tenant.
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Producing node.
    pub const fn source_node_id(&self) -> &NodeId {
        &self.source_node_id
    }

    /// Address of the producing node.
    pub fn source_node_ip(&self) -> &str {
        &self.source_node_ip
    }

    /// Origin of the request behind the event.
    pub const fn origin(&self) -> EventSource {
        self.origin
    }

    /// `eventType` label.
    pub fn event_type(&self) -> &str {
        self.payload.event_type()
    }

    /// `eventAction` label.
    pub fn event_action(&self) -> &str {
        self.payload.event_action()
    }

    /// Typed body.
    pub const fn payload(&self) -> &EventPayload {
        &self.payload
    }

    /// Creation time.
    pub const fn event_time(&self) -> DateTime<Utc> {
        self.event_time
    }

    /// Time after which delivery is abandoned.
    pub const fn expire_time(&self) -> Option<DateTime<Utc>> {
        self.expire_time
    }

    /// Whether the event has expired at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_time.is_some_and(|expire| expire <= now)
    }
}

impl TryFrom<Bytes> for ClusterEvent {
    type Error = ciborium::de::Error<std::io::Error>;

    fn try_from(bytes: Bytes) -> Result<Self, Self::Error> {
        let reader = bytes.as_ref();
        ciborium::de::from_reader(reader)
    }
}

impl TryInto<Bytes> for ClusterEvent {
    type Error = ciborium::ser::Error<std::io::Error>;

    fn try_into(self) -> Result<Bytes, Self::Error> {
        let mut writer = Vec::new();
        ciborium::ser::into_writer(&self, &mut writer)?;
        Ok(Bytes::from(writer))
    }
}

/// Outcome of one event on one node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AckStatus {
    /// Awaiting a delivery attempt.
    Pending,
    /// Delivered and acknowledged.
    Success,
    /// Last attempt failed; waiting for the reaper to reschedule.
    Failed,
    /// Given up on.
    Skipped,
}

impl AckStatus {
    /// Success and Skipped are final.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Skipped)
    }

    /// Whether the ack state machine allows moving from `self` to `next`.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Success | Self::Failed | Self::Skipped)
                | (Self::Failed, Self::Pending | Self::Skipped)
        )
    }
}

impl fmt::Display for AckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Success => write!(f, "SUCCESS"),
            Self::Failed => write!(f, "FAILED"),
            Self::Skipped => write!(f, "SKIPPED"),
        }
    }
}

/// One node's outcome for one event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEventAck {
    /// Ack id (`ACK` + timestamp + suffix).
    pub ack_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Event acknowledged.
    pub event_id: String,
    /// Sequence of that event.
    pub event_sequence: u64,
    /// Node that produced the event.
    pub source_node_id: NodeId,
    /// Target node.
    pub node_id: NodeId,
    /// Address of the target node.
    pub node_ip: String,
    /// Current status.
    pub status: AckStatus,
    /// Time of the last status change.
    pub process_time: Option<DateTime<Utc>>,
    /// Human-readable outcome of the last attempt.
    pub result_message: Option<String>,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Earliest time of the next attempt.
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl ClusterEventAck {
    /// A fresh pending ack of `event` for `node_id`.
    pub fn pending(event: &ClusterEvent, node_id: NodeId, node_ip: impl Into<String>) -> Self {
        let now = Utc::now();

        Self {
            ack_id: ids::generate(ids::ACK_ID_PREFIX, now),
            tenant_id: event.tenant_id().to_string(),
            event_id: event.event_id().to_string(),
            event_sequence: event.sequence(),
            source_node_id: event.source_node_id().clone(),
            node_id,
            node_ip: node_ip.into(),
            status: AckStatus::Pending,
            process_time: None,
            result_message: None,
            retry_count: 0,
            next_attempt_at: None,
        }
    }

    /// Whether a pending ack may be attempted at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.is_none_or(|at| at <= now)
    }
}

/// Ack counts of one event, for the admin UI.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagationStatus {
    /// Event described.
    pub event_id: String,
    /// Acks recorded.
    pub total: usize,
    /// Acks pending.
    pub pending: usize,
    /// Acks succeeded.
    pub success: usize,
    /// Acks failed and awaiting retry.
    pub failed: usize,
    /// Acks skipped.
    pub skipped: usize,
}

impl PropagationStatus {
    /// Tally `acks` of `event_id`.
    pub fn from_acks<'a>(
        event_id: impl Into<String>,
        acks: impl IntoIterator<Item = &'a ClusterEventAck>,
    ) -> Self {
        let mut status = Self {
            event_id: event_id.into(),
            ..Self::default()
        };

        for ack in acks {
            status.total += 1;
            match ack.status {
                AckStatus::Pending => status.pending += 1,
                AckStatus::Success => status.success += 1,
                AckStatus::Failed => status.failed += 1,
                AckStatus::Skipped => status.skipped += 1,
            }
        }

        status
    }

    /// Whether every recorded ack is terminal.
    pub const fn is_complete(&self) -> bool {
        self.pending == 0 && self.failed == 0
    }
}
