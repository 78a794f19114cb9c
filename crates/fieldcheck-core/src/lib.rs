//! fieldcheck core: client-side data synchronization and access control for
//! the field-sales visit app.
//!
//! - `api`: hosted backend client and the collaborator traits
//! - `auth`: sessions and the short-lived session cache
//! - `cache`: query cache, request deduplication, cross-session invalidation
//! - `access`: roles, access tiers, and sensitive-field masking
//! - `models`: visits, opportunities, tasks, profiles
//! - `storage`: persisted local key-value storage
//! - `version`: build drift detection
//! - `context`: everything above wired together for one client

pub mod access;
pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod context;
pub mod models;
pub mod storage;
pub mod utils;
pub mod version;

pub use access::{AccessTier, MaskedRecord, Role, RoleInfo};
pub use api::{ApiError, BackendClient};
pub use config::Config;
pub use context::{Backend, SyncContext};
pub use version::{VersionCheck, VersionMarker, VersionWatcher};
