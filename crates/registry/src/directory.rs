//! Service Group Directory: the authoritative owner of group state.
//!
//! Mutations are staged into a [`WriteBatch`] that the caller commits
//! together with the event describing them, so a group write is never
//! visible without its event.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use gatehouse_storage::{KeyValueStorage, PageRequest, StorageError, WriteBatch};
use parking_lot::RwLock;
use tracing::{debug, instrument};

use crate::context::{EventSource, RequestContext, event_source_from_context};
use crate::store::{GROUP_NAMES, GROUPS, GroupStore};
use crate::{
    Error, EventPayload, GroupFilter, GroupPatch, NewServiceGroup, Page, Result, ServiceGroup,
    ids,
};

/// Failure of the external dependency inventory.
#[derive(Debug, thiserror::Error)]
#[error("dependency check failed: {0}")]
pub struct DependencyCheckError(pub String);

/// Inventory of services and instances registered in groups.
#[async_trait]
pub trait DependencyChecker: Send + Sync + 'static {
    /// Number of active services or instances that depend on `group`.
    async fn active_dependents(
        &self,
        tenant_id: &str,
        group: &ServiceGroup,
    ) -> Result<u64, DependencyCheckError>;
}

#[async_trait]
impl<T: DependencyChecker> DependencyChecker for Arc<T> {
    async fn active_dependents(
        &self,
        tenant_id: &str,
        group: &ServiceGroup,
    ) -> Result<u64, DependencyCheckError> {
        (**self).active_dependents(tenant_id, group).await
    }
}

/// Dependency counts kept in memory, keyed by (tenant, group name).
#[derive(Clone, Debug, Default)]
pub struct StaticDependencies {
    counts: Arc<RwLock<HashMap<(String, String), u64>>>,
}

impl StaticDependencies {
    /// Empty inventory: every group has zero dependents.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `count` dependents of `group_name`.
    pub fn set(&self, tenant_id: impl Into<String>, group_name: impl Into<String>, count: u64) {
        self.counts
            .write()
            .insert((tenant_id.into(), group_name.into()), count);
    }
}

#[async_trait]
impl DependencyChecker for StaticDependencies {
    async fn active_dependents(
        &self,
        tenant_id: &str,
        group: &ServiceGroup,
    ) -> Result<u64, DependencyCheckError> {
        Ok(self
            .counts
            .read()
            .get(&(tenant_id.to_string(), group.group_name.clone()))
            .copied()
            .unwrap_or(0))
    }
}

/// What a successful directory mutation changed.
#[derive(Clone, Debug)]
pub struct GroupMutation {
    /// The group before the mutation; `None` for creations.
    pub before: Option<ServiceGroup>,
    /// The group after the mutation; `None` for physical deletions.
    pub after: Option<ServiceGroup>,
    /// Event body describing the change.
    pub payload: EventPayload,
}

/// Tenant-scoped registry of service groups.
#[derive(Clone, Debug)]
pub struct Directory<S, D> {
    store: GroupStore<S>,
    dependencies: D,
}

fn validate_tenant(tenant_id: &str) -> Result<()> {
    if tenant_id.is_empty() || tenant_id.contains('/') {
        return Err(Error::InvalidArgument(format!(
            "invalid tenant id '{tenant_id}'"
        )));
    }
    Ok(())
}

fn ensure_internal(ctx: &RequestContext) -> Result<()> {
    match event_source_from_context(ctx) {
        EventSource::Internal => Ok(()),
        EventSource::Sdk => Err(Error::Unauthorized(
            "SDK requests may not modify service groups".to_string(),
        )),
    }
}

fn ensure_admin(ctx: &RequestContext, group: &ServiceGroup) -> Result<()> {
    match ctx.user_id() {
        Some(user_id) if !group.can_admin(user_id) => Err(Error::Unauthorized(format!(
            "user '{user_id}' may not administer '{}'",
            group.group_name
        ))),
        _ => Ok(()),
    }
}

impl<S, D> Directory<S, D>
where
    S: KeyValueStorage,
    D: DependencyChecker,
{
    /// Create a directory over `storage`.
    pub const fn new(storage: S, dependencies: D) -> Self {
        Self {
            store: GroupStore::new(storage),
            dependencies,
        }
    }

    /// Stage the registration of a new group.
    #[instrument(skip(self, batch, ctx, new), fields(tenant_id = ctx.tenant_id(), group_name = %new.group_name))]
    pub async fn create_group(
        &self,
        batch: &mut WriteBatch,
        ctx: &RequestContext,
        new: NewServiceGroup,
    ) -> Result<GroupMutation> {
        ensure_internal(ctx)?;
        validate_tenant(ctx.tenant_id())?;

        if new.group_name.trim().is_empty() {
            return Err(Error::InvalidArgument(
                "group name must not be empty".to_string(),
            ));
        }
        if new.owner_user_id.trim().is_empty() {
            return Err(Error::InvalidOwner);
        }
        if self
            .store
            .get_active(ctx.tenant_id(), &new.group_name)
            .await?
            .is_some()
        {
            return Err(Error::DuplicateName {
                tenant_id: ctx.tenant_id().to_string(),
                group_name: new.group_name,
            });
        }

        let now = Utc::now();
        let group = ServiceGroup {
            service_group_id: ids::generate(ids::GROUP_ID_PREFIX, now),
            tenant_id: ctx.tenant_id().to_string(),
            group_name: new.group_name,
            group_type: new.group_type,
            description: new.description,
            owner_user_id: new.owner_user_id,
            admin_user_ids: new.admin_user_ids,
            read_user_ids: new.read_user_ids,
            access_control_enabled: new.access_control_enabled,
            default_config: new.default_config,
            created_at: now,
            created_by: ctx.actor().to_string(),
            modified_at: now,
            modified_by: ctx.actor().to_string(),
            version: 1,
            active: true,
        };

        self.store.stage_insert(batch, &group)?;
        debug!(service_group_id = %group.service_group_id, "Staged group creation");

        Ok(GroupMutation {
            before: None,
            after: Some(group.clone()),
            payload: EventPayload::GroupCreated { group },
        })
    }

    /// Stage a partial update of an active group at `expected_version`.
    #[instrument(skip(self, batch, ctx, patch), fields(tenant_id = ctx.tenant_id()))]
    pub async fn update_group(
        &self,
        batch: &mut WriteBatch,
        ctx: &RequestContext,
        group_name: &str,
        patch: GroupPatch,
        expected_version: u64,
    ) -> Result<GroupMutation> {
        ensure_internal(ctx)?;
        let before = self.get_group(ctx.tenant_id(), group_name, true).await?;
        ensure_admin(ctx, &before)?;

        if before.version != expected_version {
            return Err(Error::VersionConflict {
                expected: expected_version,
                current: before.version,
            });
        }
        if patch
            .owner_user_id
            .as_deref()
            .is_some_and(|owner| owner.trim().is_empty())
        {
            return Err(Error::InvalidOwner);
        }

        let mut after = before.clone();
        patch.apply_to(&mut after);
        after.version = before.version + 1;
        after.modified_at = Utc::now();
        after.modified_by = ctx.actor().to_string();

        self.store.stage_replace(batch, &after, before.version)?;
        debug!(version = after.version, "Staged group update");

        Ok(GroupMutation {
            before: Some(before),
            after: Some(after.clone()),
            payload: EventPayload::GroupUpdated { group: after },
        })
    }

    /// Stage the deletion of an active group.
    ///
    /// Logical deletion deactivates the group. Physical deletion removes it
    /// and is refused while the dependency checker reports dependents.
    #[instrument(skip(self, batch, ctx), fields(tenant_id = ctx.tenant_id()))]
    pub async fn delete_group(
        &self,
        batch: &mut WriteBatch,
        ctx: &RequestContext,
        group_name: &str,
        physical: bool,
    ) -> Result<GroupMutation> {
        ensure_internal(ctx)?;
        let before = self.get_group(ctx.tenant_id(), group_name, true).await?;
        ensure_admin(ctx, &before)?;
        let version = before.version + 1;

        let after = if physical {
            let count = self
                .dependencies
                .active_dependents(ctx.tenant_id(), &before)
                .await?;
            if count > 0 {
                return Err(Error::HasDependents {
                    group_name: group_name.to_string(),
                    count,
                });
            }

            self.store.stage_remove(batch, &before);
            None
        } else {
            let mut after = before.clone();
            after.active = false;
            after.version = version;
            after.modified_at = Utc::now();
            after.modified_by = ctx.actor().to_string();

            self.store.stage_replace(batch, &after, before.version)?;
            Some(after)
        };

        debug!(physical, "Staged group deletion");

        Ok(GroupMutation {
            payload: EventPayload::GroupDeleted {
                service_group_id: before.service_group_id.clone(),
                group_name: before.group_name.clone(),
                version,
                physical,
            },
            before: Some(before),
            after,
        })
    }

    /// Look up a group by name.
    ///
    /// With `active_only` unset, the most recently modified inactive group
    /// is returned when no active one exists.
    pub async fn get_group(
        &self,
        tenant_id: &str,
        group_name: &str,
        active_only: bool,
    ) -> Result<ServiceGroup> {
        validate_tenant(tenant_id)?;

        let group = if active_only {
            self.store.get_active(tenant_id, group_name).await?
        } else {
            self.store.get_any(tenant_id, group_name).await?
        };

        group.ok_or_else(|| Error::GroupNotFound {
            tenant_id: tenant_id.to_string(),
            group_name: group_name.to_string(),
        })
    }

    /// One page of the tenant's groups matching `filter`.
    pub async fn list_groups(
        &self,
        tenant_id: &str,
        filter: &GroupFilter,
        page: PageRequest,
    ) -> Result<Page<ServiceGroup>> {
        validate_tenant(tenant_id)?;

        let matching: Vec<_> = self
            .store
            .list(tenant_id)
            .await?
            .into_iter()
            .filter(|group| filter.matches(group))
            .collect();

        let total = matching.len();
        let items = matching
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect();

        Ok(Page { items, total })
    }

    /// Translate a failed commit of a batch staged by this directory.
    ///
    /// Losing the race on the name index of a creation is a duplicate name.
    /// Any other lost race means the group changed since it was read.
    pub async fn explain_conflict(
        &self,
        error: StorageError,
        tenant_id: &str,
        mutation: &GroupMutation,
    ) -> Error {
        let StorageError::PreconditionFailed { namespace, .. } = &error else {
            return Error::Storage(error);
        };
        if *namespace != *GROUP_NAMES && *namespace != *GROUPS {
            return Error::Storage(error);
        }

        let Some(before) = &mutation.before else {
            let group_name = mutation
                .after
                .as_ref()
                .map(|group| group.group_name.clone())
                .unwrap_or_default();
            return Error::DuplicateName {
                tenant_id: tenant_id.to_string(),
                group_name,
            };
        };

        match self.store.get_active(tenant_id, &before.group_name).await {
            Ok(Some(current)) => Error::VersionConflict {
                expected: before.version,
                current: current.version,
            },
            Ok(None) => Error::GroupNotFound {
                tenant_id: tenant_id.to_string(),
                group_name: before.group_name.clone(),
            },
            Err(e) => e,
        }
    }
}
