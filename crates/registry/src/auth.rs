//! Resolution of the service group an SDK client claims to belong to.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::context::{EventSource, RequestContext, event_source_from_context};
use crate::manager::RegistryManagement;
use crate::{Error, Result, ServiceGroup};

/// Group membership asserted by an SDK client on registration.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupClaim {
    /// Name of the group the client registers into.
    pub group_name: String,
    /// Identifier the client was issued, checked when present.
    #[serde(default)]
    pub service_group_id: Option<String>,
}

/// Checks SDK claims against the registry.
#[derive(Clone, Debug)]
pub struct SdkAuthenticator<M> {
    registry: M,
}

impl<M> SdkAuthenticator<M>
where
    M: RegistryManagement,
{
    /// Create an authenticator backed by `registry`.
    pub const fn new(registry: M) -> Self {
        Self { registry }
    }

    /// The active group `claim` refers to, if the caller may use it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unauthorized`] when the context is not an SDK
    /// context, the group is missing or inactive, the claimed id does not
    /// match, or access control excludes the caller.
    pub async fn authenticate(
        &self,
        ctx: &RequestContext,
        claim: &GroupClaim,
    ) -> Result<ServiceGroup> {
        let client_ip = ctx.client_ip().unwrap_or("unknown");

        if event_source_from_context(ctx) != EventSource::Sdk {
            return Err(Error::Unauthorized(
                "group claims are only accepted from SDK clients".to_string(),
            ));
        }

        let group = match self
            .registry
            .get_group(ctx.tenant_id(), &claim.group_name, true)
            .await
        {
            Ok(group) => group,
            Err(Error::GroupNotFound { .. }) => {
                warn!(
                    tenant_id = ctx.tenant_id(),
                    group_name = %claim.group_name,
                    client_ip,
                    "SDK claimed unknown service group"
                );
                return Err(Error::Unauthorized(format!(
                    "unknown service group '{}'",
                    claim.group_name
                )));
            }
            Err(e) => return Err(e),
        };

        if let Some(claimed_id) = &claim.service_group_id
            && *claimed_id != group.service_group_id
        {
            warn!(
                tenant_id = ctx.tenant_id(),
                group_name = %claim.group_name,
                claimed_id = %claimed_id,
                client_ip,
                "SDK claimed mismatched service group id"
            );
            return Err(Error::Unauthorized(format!(
                "service group id does not match '{}'",
                claim.group_name
            )));
        }

        if let Some(user_id) = ctx.user_id()
            && !group.can_read(user_id)
        {
            return Err(Error::Unauthorized(format!(
                "user '{user_id}' may not use '{}'",
                claim.group_name
            )));
        }

        debug!(
            tenant_id = ctx.tenant_id(),
            service_group_id = %group.service_group_id,
            client_ip,
            "Authenticated SDK client"
        );

        Ok(group)
    }
}
