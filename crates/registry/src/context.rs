//! Request-scoped event source tagging.
//!
//! A [`ContextBuilder`] collects the caller's identity. It only becomes a
//! [`RequestContext`] through [`with_event_source`], and a context has no
//! setter for its source, so the tag is set exactly once per request.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a request originated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventSource {
    /// Admin UI or control plane.
    Internal,
    /// A registered SDK client reporting in.
    Sdk,
}

impl fmt::Display for EventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internal => write!(f, "INTERNAL"),
            Self::Sdk => write!(f, "SDK"),
        }
    }
}

/// Untagged request identity.
#[derive(Clone, Debug)]
pub struct ContextBuilder {
    tenant_id: String,
    user_id: Option<String>,
    client_ip: Option<String>,
}

impl ContextBuilder {
    /// Start a context for `tenant_id`.
    pub fn new(tenant_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: None,
            client_ip: None,
        }
    }

    /// Set the acting user.
    #[must_use]
    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Set the remote address of the caller.
    #[must_use]
    pub fn client_ip(mut self, client_ip: impl Into<String>) -> Self {
        self.client_ip = Some(client_ip.into());
        self
    }
}

/// Immutable identity of one request, tagged with its [`EventSource`].
#[derive(Clone, Debug)]
pub struct RequestContext {
    tenant_id: String,
    user_id: Option<String>,
    client_ip: Option<String>,
    source: EventSource,
}

impl RequestContext {
    /// Tenant the request acts on.
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Acting user, if authenticated as one.
    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    /// Remote address of the caller, if known.
    pub fn client_ip(&self) -> Option<&str> {
        self.client_ip.as_deref()
    }

    /// Actor recorded in audit fields.
    pub fn actor(&self) -> &str {
        self.user_id.as_deref().unwrap_or(match self.source {
            EventSource::Internal => "system",
            EventSource::Sdk => "sdk",
        })
    }
}

/// Tag `builder` with its origin, producing the request context.
pub fn with_event_source(builder: ContextBuilder, source: EventSource) -> RequestContext {
    RequestContext {
        tenant_id: builder.tenant_id,
        user_id: builder.user_id,
        client_ip: builder.client_ip,
        source,
    }
}

/// Read the origin tag of a context.
pub const fn event_source_from_context(ctx: &RequestContext) -> EventSource {
    ctx.source
}
