use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use gatehouse_locks::{LockManager, ScopedLockManager};
use gatehouse_storage::{KeyValueStorage, PageRequest, WriteBatch};
use gatehouse_topology::Node;
use tracing::{info, warn};

use crate::config::RegistryConfig;
use crate::context::{RequestContext, event_source_from_context};
use crate::directory::{DependencyChecker, Directory, GroupMutation};
use crate::distributor::EventIntake;
use crate::event::later;
use crate::store::EventLogStore;
use crate::{
    ClusterEvent, ClusterEventAck, EffectiveServiceConfig, Error, EventDraft, GroupFilter,
    GroupPatch, NewServiceGroup, Page, PropagationStatus, Result, ServiceGroup,
};

/// Operations the registry offers to HTTP controllers and SDK middleware.
#[async_trait]
pub trait RegistryManagement
where
    Self: Clone + Send + Sync + 'static,
{
    /// Register a new group.
    async fn create_group(
        &self,
        ctx: &RequestContext,
        new: NewServiceGroup,
    ) -> Result<ServiceGroup>;

    /// Partially update an active group at `expected_version`.
    async fn update_group(
        &self,
        ctx: &RequestContext,
        group_name: &str,
        patch: GroupPatch,
        expected_version: u64,
    ) -> Result<ServiceGroup>;

    /// Delete an active group, logically unless `physical` is set.
    async fn delete_group(
        &self,
        ctx: &RequestContext,
        group_name: &str,
        physical: bool,
    ) -> Result<()>;

    /// Look up a group by name.
    async fn get_group(
        &self,
        tenant_id: &str,
        group_name: &str,
        active_only: bool,
    ) -> Result<ServiceGroup>;

    /// One page of a tenant's groups.
    async fn list_groups(
        &self,
        tenant_id: &str,
        filter: GroupFilter,
        page: PageRequest,
    ) -> Result<Page<ServiceGroup>>;

    /// Configuration a service newly registered in the group starts with.
    async fn effective_service_config(
        &self,
        tenant_id: &str,
        group_name: &str,
    ) -> Result<EffectiveServiceConfig>;

    /// A tenant's events still in the log, in append order.
    async fn list_events(&self, tenant_id: &str) -> Result<Vec<ClusterEvent>>;

    /// A single event.
    async fn get_event(&self, event_id: &str) -> Result<ClusterEvent>;

    /// Acks recorded for an event.
    async fn list_acks(&self, event_id: &str) -> Result<Vec<ClusterEventAck>>;

    /// Ack counts of an event.
    async fn propagation_status(&self, event_id: &str) -> Result<PropagationStatus>;
}

/// The registry façade: serializes mutations per (tenant, group name),
/// commits each one together with its cluster event and hands the event to
/// the distributor.
pub struct RegistryManager<S, L, D> {
    config: RegistryConfig,
    directory: Arc<Directory<S, D>>,
    events: EventLogStore<S>,
    intake: EventIntake,
    local: Node,
    locks: L,
    storage: S,
}

impl<S, L, D> RegistryManager<S, L, D>
where
    S: KeyValueStorage,
    L: ScopedLockManager,
    D: DependencyChecker,
{
    /// Create a manager acting as `local`.
    ///
    /// # Arguments
    ///
    /// * `storage` - Shared store holding groups, events and acks
    /// * `locks` - Lock manager scoped per tenant for mutations
    /// * `dependencies` - Inventory consulted before physical deletes
    /// * `local` - Identity stamped on produced events
    /// * `intake` - Distributor hand-off for appended events
    /// * `config` - Registry configuration
    pub fn new(
        storage: S,
        locks: L,
        dependencies: D,
        local: Node,
        intake: EventIntake,
        config: RegistryConfig,
    ) -> Self {
        Self {
            directory: Arc::new(Directory::new(storage.clone(), dependencies)),
            events: EventLogStore::new(storage.clone()),
            config,
            intake,
            local,
            locks,
            storage,
        }
    }

    /// The directory backing this manager.
    pub fn directory(&self) -> &Directory<S, D> {
        &self.directory
    }

    async fn lock(
        &self,
        tenant_id: &str,
        group_name: &str,
    ) -> Result<<L::Scoped as LockManager>::Guard> {
        self.locks
            .scope(tenant_id)
            .lock(group_name.to_string())
            .await
            .map_err(|e| Error::Lock(e.to_string()))
    }

    /// Append the event describing `mutation` to `batch` and commit both.
    async fn commit(
        &self,
        ctx: &RequestContext,
        mut batch: WriteBatch,
        mutation: &GroupMutation,
    ) -> Result<ClusterEvent> {
        let now = Utc::now();
        let event = ClusterEvent::new(EventDraft {
            sequence: self.events.next_sequence().await?,
            tenant_id: ctx.tenant_id().to_string(),
            source_node_id: self.local.node_id().clone(),
            source_node_ip: self.local.ip().to_string(),
            origin: event_source_from_context(ctx),
            payload: mutation.payload.clone(),
            event_time: now,
            expire_time: self.config.distributor.event_ttl.map(|ttl| later(now, ttl)),
        })?;
        self.events.stage_append(&mut batch, &event)?;

        if let Err(e) = self.storage.commit(batch).await {
            warn!(
                tenant_id = ctx.tenant_id(),
                event_id = event.event_id(),
                "Group mutation not applied: {e}"
            );
            return Err(self
                .directory
                .explain_conflict(e, ctx.tenant_id(), mutation)
                .await);
        }

        info!(
            tenant_id = ctx.tenant_id(),
            event_id = event.event_id(),
            action = event.event_action(),
            service_group_id = ?mutation.payload.service_group_id(),
            "Committed group mutation"
        );

        self.intake.submit(event.clone());
        Ok(event)
    }

    fn page(&self, page: PageRequest) -> PageRequest {
        let limit = match page.limit {
            0 => self.config.default_page_size,
            limit => limit.min(self.config.max_page_size),
        };

        PageRequest {
            offset: page.offset,
            limit,
        }
    }
}

impl<S, L, D> Clone for RegistryManager<S, L, D>
where
    S: Clone,
    L: Clone,
{
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            directory: Arc::clone(&self.directory),
            events: self.events.clone(),
            intake: self.intake.clone(),
            local: self.local.clone(),
            locks: self.locks.clone(),
            storage: self.storage.clone(),
        }
    }
}

#[async_trait]
impl<S, L, D> RegistryManagement for RegistryManager<S, L, D>
where
    S: KeyValueStorage,
    L: ScopedLockManager,
    D: DependencyChecker,
{
    async fn create_group(
        &self,
        ctx: &RequestContext,
        new: NewServiceGroup,
    ) -> Result<ServiceGroup> {
        let _guard = self.lock(ctx.tenant_id(), &new.group_name).await?;

        let mut batch = WriteBatch::new();
        let mutation = self.directory.create_group(&mut batch, ctx, new).await?;
        self.commit(ctx, batch, &mutation).await?;

        mutation
            .after
            .ok_or_else(|| Error::Codec("creation produced no group".to_string()))
    }

    async fn update_group(
        &self,
        ctx: &RequestContext,
        group_name: &str,
        patch: GroupPatch,
        expected_version: u64,
    ) -> Result<ServiceGroup> {
        let _guard = self.lock(ctx.tenant_id(), group_name).await?;

        let mut batch = WriteBatch::new();
        let mutation = self
            .directory
            .update_group(&mut batch, ctx, group_name, patch, expected_version)
            .await?;
        self.commit(ctx, batch, &mutation).await?;

        mutation
            .after
            .ok_or_else(|| Error::Codec("update produced no group".to_string()))
    }

    async fn delete_group(
        &self,
        ctx: &RequestContext,
        group_name: &str,
        physical: bool,
    ) -> Result<()> {
        let _guard = self.lock(ctx.tenant_id(), group_name).await?;

        let mut batch = WriteBatch::new();
        let mutation = self
            .directory
            .delete_group(&mut batch, ctx, group_name, physical)
            .await?;
        self.commit(ctx, batch, &mutation).await?;

        Ok(())
    }

    async fn get_group(
        &self,
        tenant_id: &str,
        group_name: &str,
        active_only: bool,
    ) -> Result<ServiceGroup> {
        self.directory
            .get_group(tenant_id, group_name, active_only)
            .await
    }

    async fn list_groups(
        &self,
        tenant_id: &str,
        filter: GroupFilter,
        page: PageRequest,
    ) -> Result<Page<ServiceGroup>> {
        self.directory
            .list_groups(tenant_id, &filter, self.page(page))
            .await
    }

    async fn effective_service_config(
        &self,
        tenant_id: &str,
        group_name: &str,
    ) -> Result<EffectiveServiceConfig> {
        let group = self.directory.get_group(tenant_id, group_name, true).await?;
        Ok(group.inherit_defaults(&self.config.service_defaults))
    }

    async fn list_events(&self, tenant_id: &str) -> Result<Vec<ClusterEvent>> {
        self.events.list_events(Some(tenant_id)).await
    }

    async fn get_event(&self, event_id: &str) -> Result<ClusterEvent> {
        self.events
            .get_event(event_id)
            .await?
            .ok_or_else(|| Error::EventNotFound(event_id.to_string()))
    }

    async fn list_acks(&self, event_id: &str) -> Result<Vec<ClusterEventAck>> {
        Ok(self
            .events
            .list_acks(event_id)
            .await?
            .into_iter()
            .map(|stored| stored.value)
            .collect())
    }

    async fn propagation_status(&self, event_id: &str) -> Result<PropagationStatus> {
        let event = self.get_event(event_id).await?;
        let acks = self.list_acks(event_id).await?;

        Ok(PropagationStatus::from_acks(event.event_id(), &acks))
    }
}
