//! Cluster coordination core of the gateway control plane: the service
//! group directory, the cluster event log and the distributor that
//! propagates every group mutation to the other gateway nodes.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod auth;
mod config;
mod context;
mod directory;
mod distributor;
mod error;
mod event;
mod group;
pub mod ids;
mod inbox;
mod manager;
pub mod store;

pub use auth::{GroupClaim, SdkAuthenticator};
pub use config::{DistributorConfig, RegistryConfig};
pub use context::{
    ContextBuilder, EventSource, RequestContext, event_source_from_context, with_event_source,
};
pub use directory::{
    DependencyCheckError, DependencyChecker, Directory, GroupMutation, StaticDependencies,
};
pub use distributor::{EventDistributor, EventIntake, ReapReport};
pub use error::{DeliveryError, Error, Result};
pub use event::{
    AckStatus, ClusterEvent, ClusterEventAck, EventDraft, EventPayload, PropagationStatus,
    SERVICE_GROUP_EVENT,
};
pub use group::{
    DefaultServiceConfig, EffectiveServiceConfig, GroupFilter, GroupPatch, GroupType,
    NewServiceGroup, Page, ServiceDefaults, ServiceGroup,
};
pub use inbox::{DEFAULT_INBOX_RETENTION, EventInbox, GroupReplica};
pub use manager::{RegistryManagement, RegistryManager};
