//! Access policy: who the user is, what tier they get on a record, and how
//! records are redacted for limited viewers.
//!
//! Masking here is a presentation concern. The backend's row-level policies
//! remain the enforcement point.

pub mod mask;
pub mod role;
pub mod tier;

pub use mask::{mask, mask_all, Maskable, MaskedRecord, MASK_INDICATOR, REDACTED};
pub use role::{AccessPolicyResolver, Role, RoleAssignment, RoleInfo, ROLE_GC_TIME, ROLE_STALE_TIME};
pub use tier::{resolve_access_tier, AccessTier, OwnedResource, Requester, ResourceScope};
