use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of a service group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupType {
    /// Groups owned by the platform itself.
    System,
    /// Ordinary tenant groups.
    Business,
    /// Groups fronting services outside the tenant.
    External,
}

impl fmt::Display for GroupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::System => write!(f, "SYSTEM"),
            Self::Business => write!(f, "BUSINESS"),
            Self::External => write!(f, "EXTERNAL"),
        }
    }
}

/// Default-configuration template inherited by services registered in a
/// group. Unset fields fall back to gateway-wide [`ServiceDefaults`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultServiceConfig {
    /// Protocol spoken by services, e.g. `HTTP` or `GRPC`.
    pub protocol_type: Option<String>,
    /// Load-balancing strategy, e.g. `ROUND_ROBIN`.
    pub load_balance_strategy: Option<String>,
    /// Health-check URL path.
    pub health_check_url: Option<String>,
    /// Interval between health checks.
    pub health_check_interval: Option<Duration>,
    /// Timeout of one health check.
    pub health_check_timeout: Option<Duration>,
}

/// Gateway-wide fallbacks for [`DefaultServiceConfig`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceDefaults {
    /// Fallback protocol.
    pub protocol_type: String,
    /// Fallback load-balancing strategy.
    pub load_balance_strategy: String,
    /// Fallback health-check URL; none means health checks are off.
    pub health_check_url: Option<String>,
    /// Fallback health-check interval.
    pub health_check_interval: Duration,
    /// Fallback health-check timeout.
    pub health_check_timeout: Duration,
}

impl Default for ServiceDefaults {
    fn default() -> Self {
        Self {
            protocol_type: "HTTP".to_string(),
            load_balance_strategy: "ROUND_ROBIN".to_string(),
            health_check_url: None,
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(5),
        }
    }
}

/// Fully resolved configuration a newly registered service starts with.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectiveServiceConfig {
    /// Protocol spoken by the service.
    pub protocol_type: String,
    /// Load-balancing strategy.
    pub load_balance_strategy: String,
    /// Health-check URL, if checks are enabled.
    pub health_check_url: Option<String>,
    /// Interval between health checks.
    pub health_check_interval: Duration,
    /// Timeout of one health check.
    pub health_check_timeout: Duration,
}

/// A tenant-scoped namespace for registered services.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceGroup {
    /// System-generated id (`GRP` + timestamp + suffix).
    pub service_group_id: String,

    /// Owning tenant.
    pub tenant_id: String,

    /// Name, unique per tenant among active groups.
    pub group_name: String,

    /// Kind of group.
    pub group_type: GroupType,

    /// Free-text description.
    pub description: Option<String>,

    /// Owning user; never empty.
    pub owner_user_id: String,

    /// Users allowed to administer the group besides the owner.
    pub admin_user_ids: BTreeSet<String>,

    /// Users allowed to read the group when access control is enabled.
    pub read_user_ids: BTreeSet<String>,

    /// Whether reads are restricted to owner, admins and readers.
    pub access_control_enabled: bool,

    /// Template inherited by registered services.
    pub default_config: DefaultServiceConfig,

    /// Creation time.
    pub created_at: DateTime<Utc>,

    /// Creating actor.
    pub created_by: String,

    /// Last modification time.
    pub modified_at: DateTime<Utc>,

    /// Last modifying actor.
    pub modified_by: String,

    /// Optimistic concurrency counter; 1 on creation, +1 per mutation.
    pub version: u64,

    /// False once logically deleted.
    pub active: bool,
}

impl ServiceGroup {
    /// Whether `user_id` may administer this group.
    pub fn can_admin(&self, user_id: &str) -> bool {
        self.owner_user_id == user_id || self.admin_user_ids.contains(user_id)
    }

    /// Whether `user_id` may read this group.
    pub fn can_read(&self, user_id: &str) -> bool {
        !self.access_control_enabled
            || self.can_admin(user_id)
            || self.read_user_ids.contains(user_id)
    }

    /// Resolve the configuration a newly registered service inherits.
    pub fn inherit_defaults(&self, defaults: &ServiceDefaults) -> EffectiveServiceConfig {
        let template = &self.default_config;

        EffectiveServiceConfig {
            protocol_type: template
                .protocol_type
                .clone()
                .unwrap_or_else(|| defaults.protocol_type.clone()),
            load_balance_strategy: template
                .load_balance_strategy
                .clone()
                .unwrap_or_else(|| defaults.load_balance_strategy.clone()),
            health_check_url: template
                .health_check_url
                .clone()
                .or_else(|| defaults.health_check_url.clone()),
            health_check_interval: template
                .health_check_interval
                .unwrap_or(defaults.health_check_interval),
            health_check_timeout: template
                .health_check_timeout
                .unwrap_or(defaults.health_check_timeout),
        }
    }
}

/// Registration request for a new group.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewServiceGroup {
    /// Name, unique per tenant among active groups.
    pub group_name: String,
    /// Kind of group.
    pub group_type: GroupType,
    /// Free-text description.
    pub description: Option<String>,
    /// Owning user; must not be empty.
    pub owner_user_id: String,
    /// Additional administrators.
    pub admin_user_ids: BTreeSet<String>,
    /// Readers when access control is enabled.
    pub read_user_ids: BTreeSet<String>,
    /// Whether reads are restricted.
    pub access_control_enabled: bool,
    /// Template inherited by registered services.
    pub default_config: DefaultServiceConfig,
}

impl NewServiceGroup {
    /// A business group with no extra permissions and an empty template.
    pub fn new(group_name: impl Into<String>, owner_user_id: impl Into<String>) -> Self {
        Self {
            group_name: group_name.into(),
            group_type: GroupType::Business,
            description: None,
            owner_user_id: owner_user_id.into(),
            admin_user_ids: BTreeSet::new(),
            read_user_ids: BTreeSet::new(),
            access_control_enabled: false,
            default_config: DefaultServiceConfig::default(),
        }
    }
}

/// Partial update of a group. `None` leaves a field unchanged.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GroupPatch {
    /// New kind.
    pub group_type: Option<GroupType>,
    /// New description.
    pub description: Option<String>,
    /// New owner; must not be empty.
    pub owner_user_id: Option<String>,
    /// Replacement administrator set.
    pub admin_user_ids: Option<BTreeSet<String>>,
    /// Replacement reader set.
    pub read_user_ids: Option<BTreeSet<String>>,
    /// New access-control flag.
    pub access_control_enabled: Option<bool>,
    /// Replacement template.
    pub default_config: Option<DefaultServiceConfig>,
}

impl GroupPatch {
    /// Whether the patch changes nothing.
    pub const fn is_empty(&self) -> bool {
        self.group_type.is_none()
            && self.description.is_none()
            && self.owner_user_id.is_none()
            && self.admin_user_ids.is_none()
            && self.read_user_ids.is_none()
            && self.access_control_enabled.is_none()
            && self.default_config.is_none()
    }

    pub(crate) fn apply_to(self, group: &mut ServiceGroup) {
        if let Some(group_type) = self.group_type {
            group.group_type = group_type;
        }
        if let Some(description) = self.description {
            group.description = Some(description);
        }
        if let Some(owner_user_id) = self.owner_user_id {
            group.owner_user_id = owner_user_id;
        }
        if let Some(admin_user_ids) = self.admin_user_ids {
            group.admin_user_ids = admin_user_ids;
        }
        if let Some(read_user_ids) = self.read_user_ids {
            group.read_user_ids = read_user_ids;
        }
        if let Some(access_control_enabled) = self.access_control_enabled {
            group.access_control_enabled = access_control_enabled;
        }
        if let Some(default_config) = self.default_config {
            group.default_config = default_config;
        }
    }
}

/// Criteria for listing groups.
#[derive(Clone, Debug, Default)]
pub struct GroupFilter {
    /// Case-insensitive substring of the group name.
    pub name_contains: Option<String>,
    /// Only groups of this kind.
    pub group_type: Option<GroupType>,
    /// Only groups owned by this user.
    pub owner_user_id: Option<String>,
    /// Include logically deleted groups.
    pub include_inactive: bool,
}

impl GroupFilter {
    pub(crate) fn matches(&self, group: &ServiceGroup) -> bool {
        (self.include_inactive || group.active)
            && self.group_type.is_none_or(|t| t == group.group_type)
            && self
                .owner_user_id
                .as_deref()
                .is_none_or(|owner| owner == group.owner_user_id)
            && self.name_contains.as_deref().is_none_or(|needle| {
                group
                    .group_name
                    .to_lowercase()
                    .contains(&needle.to_lowercase())
            })
    }
}

/// One page of results plus the total number of matches.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Items on this page.
    pub items: Vec<T>,
    /// Matches across all pages.
    pub total: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group() -> ServiceGroup {
        let now = Utc::now();
        ServiceGroup {
            service_group_id: "GRP20240101000000abcd".to_string(),
            tenant_id: "t1".to_string(),
            group_name: "user-services".to_string(),
            group_type: GroupType::Business,
            description: None,
            owner_user_id: "admin001".to_string(),
            admin_user_ids: BTreeSet::from(["ops".to_string()]),
            read_user_ids: BTreeSet::from(["viewer".to_string()]),
            access_control_enabled: false,
            default_config: DefaultServiceConfig::default(),
            created_at: now,
            created_by: "admin001".to_string(),
            modified_at: now,
            modified_by: "admin001".to_string(),
            version: 1,
            active: true,
        }
    }

    #[test]
    fn test_permissions() {
        let mut group = group();

        assert!(group.can_admin("admin001"));
        assert!(group.can_admin("ops"));
        assert!(!group.can_admin("viewer"));
        assert!(group.can_read("stranger"));

        group.access_control_enabled = true;
        assert!(group.can_read("viewer"));
        assert!(group.can_read("ops"));
        assert!(!group.can_read("stranger"));
    }

    #[test]
    fn test_inherit_defaults() {
        let mut group = group();
        group.default_config.protocol_type = Some("GRPC".to_string());
        group.default_config.health_check_timeout = Some(Duration::from_secs(2));

        let effective = group.inherit_defaults(&ServiceDefaults::default());
        assert_eq!(effective.protocol_type, "GRPC");
        assert_eq!(effective.load_balance_strategy, "ROUND_ROBIN");
        assert_eq!(effective.health_check_interval, Duration::from_secs(30));
        assert_eq!(effective.health_check_timeout, Duration::from_secs(2));
        assert_eq!(effective.health_check_url, None);
    }

    #[test]
    fn test_patch_only_touches_set_fields() {
        let mut group = group();
        let patch = GroupPatch {
            description: Some("users".to_string()),
            access_control_enabled: Some(true),
            ..GroupPatch::default()
        };
        assert!(!patch.is_empty());

        patch.apply_to(&mut group);
        assert_eq!(group.description.as_deref(), Some("users"));
        assert!(group.access_control_enabled);
        assert_eq!(group.owner_user_id, "admin001");
    }

    #[test]
    fn test_filter() {
        let mut group = group();
        let filter = GroupFilter {
            name_contains: Some("USER".to_string()),
            ..GroupFilter::default()
        };
        assert!(filter.matches(&group));

        group.active = false;
        assert!(!filter.matches(&group));

        let filter = GroupFilter {
            include_inactive: true,
            group_type: Some(GroupType::System),
            ..GroupFilter::default()
        };
        assert!(!filter.matches(&group));
    }
}
