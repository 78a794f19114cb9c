use std::fmt;

use serde::{Deserialize, Serialize};

use super::role::RoleInfo;

/// Visibility level a requester has on one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "lowercase")]
pub enum AccessTier {
    Full,
    Owner,
    Supervisor,
    Limited,
}

impl AccessTier {
    pub fn sees_sensitive_fields(self) -> bool {
        self != AccessTier::Limited
    }
}

impl fmt::Display for AccessTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AccessTier::Full => "full",
            AccessTier::Owner => "owner",
            AccessTier::Supervisor => "supervisor",
            AccessTier::Limited => "limited",
        };
        f.write_str(s)
    }
}

/// The user asking to see a record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Requester {
    pub user_id: String,
    pub filial: Option<String>,
}

/// Ownership and branch of a record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceScope {
    pub owner_id: Option<String>,
    pub filial: Option<String>,
}

/// Records that belong to a user and a branch.
pub trait OwnedResource {
    fn scope(&self) -> ResourceScope;
}

fn same_filial(a: Option<&str>, b: Option<&str>) -> bool {
    match (a.map(str::trim), b.map(str::trim)) {
        (Some(a), Some(b)) => !a.is_empty() && a == b,
        _ => false,
    }
}

/// Tier for `requester` on `resource`. Rules are checked in order:
/// admin or manager, owner, supervisor of the same branch, everyone else.
pub fn resolve_access_tier(
    requester: Option<&Requester>,
    resource: &ResourceScope,
    role: &RoleInfo,
) -> AccessTier {
    let Some(requester) = requester else {
        return AccessTier::Limited;
    };
    if role.is_admin || role.is_manager {
        return AccessTier::Full;
    }
    if resource.owner_id.as_deref() == Some(requester.user_id.as_str()) {
        return AccessTier::Owner;
    }
    if role.is_supervisor && same_filial(requester.filial.as_deref(), resource.filial.as_deref()) {
        return AccessTier::Supervisor;
    }
    AccessTier::Limited
}
