use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, warn};

use super::tier::Requester;
use crate::api::{ApiError, RoleStore};
use crate::auth::AuthUser;
use crate::cache::{QueryCache, QueryKey, QueryOptions};
use crate::models::Profile;

/// Role lookups stay fresh for five minutes.
pub const ROLE_STALE_TIME: Duration = Duration::from_secs(5 * 60);
pub const ROLE_GC_TIME: Duration = Duration::from_secs(10 * 60);

const ROLE_KEY: &str = "user-role";
const PROFILE_KEY: &str = "profile";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Supervisor,
    Rac,
    Consultant,
    None,
}

impl Role {
    /// Unrecognized role names grant nothing.
    pub fn parse(s: &str) -> Role {
        match s.trim().to_ascii_lowercase().as_str() {
            "admin" => Role::Admin,
            "supervisor" => Role::Supervisor,
            "rac" => Role::Rac,
            "consultant" => Role::Consultant,
            _ => Role::None,
        }
    }

    /// Higher wins when a user holds several roles.
    pub fn priority(self) -> u8 {
        match self {
            Role::Admin => 4,
            Role::Supervisor => 3,
            Role::Rac => 2,
            Role::Consultant => 1,
            Role::None => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Supervisor => "supervisor",
            Role::Rac => "rac",
            Role::Consultant => "consultant",
            Role::None => "none",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn deserialize_role<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Role, D::Error> {
    let raw = String::deserialize(deserializer)?;
    let role = Role::parse(&raw);
    if role == Role::None && !raw.eq_ignore_ascii_case("none") {
        warn!(role = %raw, "Unknown role name, granting no access");
    }
    Ok(role)
}

/// One row of the role-assignment table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub user_id: String,
    #[serde(deserialize_with = "deserialize_role")]
    pub role: Role,
}

/// Resolved role summary for the current user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct RoleInfo {
    /// Distinct roles held, highest priority first.
    pub roles: Vec<Role>,
    /// Highest-priority role, `Role::None` when nothing is assigned.
    pub role: Role,
    pub is_admin: bool,
    pub is_supervisor: bool,
    /// Manager-level access. No separate manager role exists, so only
    /// administrators qualify.
    pub is_manager: bool,
}

impl RoleInfo {
    pub fn none() -> Self {
        Self::from_roles(std::iter::empty())
    }

    pub fn from_roles(roles: impl IntoIterator<Item = Role>) -> Self {
        let mut roles: Vec<Role> = roles.into_iter().filter(|r| *r != Role::None).collect();
        roles.sort_by_key(|r| std::cmp::Reverse(r.priority()));
        roles.dedup();

        let role = roles.first().copied().unwrap_or(Role::None);
        let is_admin = roles.contains(&Role::Admin);
        Self {
            is_supervisor: roles.contains(&Role::Supervisor),
            is_manager: is_admin,
            is_admin,
            role,
            roles,
        }
    }
}

impl Default for RoleInfo {
    fn default() -> Self {
        Self::none()
    }
}

/// Resolves the current user's roles and profile through the query cache.
#[derive(Clone)]
pub struct AccessPolicyResolver {
    store: Arc<dyn RoleStore>,
    cache: QueryCache,
}

impl AccessPolicyResolver {
    pub fn new(store: Arc<dyn RoleStore>, cache: QueryCache) -> Self {
        Self { store, cache }
    }

    pub fn role_key(user_id: &str) -> QueryKey {
        QueryKey::new([ROLE_KEY, user_id])
    }

    pub fn profile_key(user_id: &str) -> QueryKey {
        QueryKey::new([PROFILE_KEY, user_id])
    }

    /// Prefix covering every cached role lookup.
    pub fn role_prefix() -> [&'static str; 1] {
        [ROLE_KEY]
    }

    pub fn profile_prefix() -> [&'static str; 1] {
        [PROFILE_KEY]
    }

    fn options() -> QueryOptions {
        QueryOptions::default()
            .with_stale_time(ROLE_STALE_TIME)
            .with_gc_time(ROLE_GC_TIME)
            .with_refetch_on_window_focus(false)
    }

    /// Role summary for `user`. Signed out, or a failed lookup, yields no roles.
    pub async fn resolve_role(&self, user: Option<&AuthUser>) -> RoleInfo {
        let Some(user) = user else {
            return RoleInfo::none();
        };
        match self.fetch_roles(&user.id).await {
            Ok(rows) => {
                let info = RoleInfo::from_roles(
                    rows.into_iter()
                        .filter(|row| row.user_id == user.id)
                        .map(|row| row.role),
                );
                debug!(user_id = %user.id, role = %info.role, "Resolved role");
                info
            }
            Err(e) => {
                warn!(user_id = %user.id, error = %e, "Role lookup failed, granting no access");
                RoleInfo::none()
            }
        }
    }

    async fn fetch_roles(&self, user_id: &str) -> Result<Vec<RoleAssignment>, ApiError> {
        let store = Arc::clone(&self.store);
        let id = user_id.to_string();
        self.cache
            .fetch(
                &Self::role_key(user_id),
                move || {
                    let store = Arc::clone(&store);
                    let id = id.clone();
                    async move { store.fetch_roles(&id).await }
                },
                &Self::options(),
            )
            .await
    }

    /// Profile of `user`, `None` when signed out, missing, or unavailable.
    pub async fn resolve_profile(&self, user: Option<&AuthUser>) -> Option<Profile> {
        let user = user?;
        let store = Arc::clone(&self.store);
        let id = user.id.clone();
        let result = self
            .cache
            .fetch(
                &Self::profile_key(&user.id),
                move || {
                    let store = Arc::clone(&store);
                    let id = id.clone();
                    async move { store.fetch_profile(&id).await }
                },
                &Self::options(),
            )
            .await;
        match result {
            Ok(profile) => profile,
            Err(e) => {
                warn!(user_id = %user.id, error = %e, "Profile lookup failed");
                None
            }
        }
    }

    /// Requester identity used for tier resolution.
    pub async fn requester(&self, user: Option<&AuthUser>) -> Option<Requester> {
        let user = user?;
        let filial = self.resolve_profile(Some(user)).await.and_then(|p| p.filial);
        Some(Requester {
            user_id: user.id.clone(),
            filial,
        })
    }
}
