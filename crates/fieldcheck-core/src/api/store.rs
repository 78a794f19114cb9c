use async_trait::async_trait;

use super::ApiError;
use crate::access::RoleAssignment;
use crate::models::{Opportunity, Profile, Task, Visit};

/// Durable role and profile records.
#[async_trait]
pub trait RoleStore: Send + Sync {
    /// Role rows assigned to `user_id`.
    async fn fetch_roles(&self, user_id: &str) -> Result<Vec<RoleAssignment>, ApiError>;

    async fn fetch_profile(&self, user_id: &str) -> Result<Option<Profile>, ApiError>;
}

/// Domain records visible to the signed-in user.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn fetch_visits(&self) -> Result<Vec<Visit>, ApiError>;
    async fn fetch_opportunities(&self) -> Result<Vec<Opportunity>, ApiError>;
    async fn fetch_tasks(&self) -> Result<Vec<Task>, ApiError>;
}
