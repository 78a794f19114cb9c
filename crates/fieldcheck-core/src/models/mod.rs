//! Data models for field-sales entities.
//!
//! - `Visit`: a customer visit with its checklist
//! - `Opportunity`: prospect/sales pipeline entry
//! - `Task`: follow-up work item
//! - `Profile`: user profile carrying the branch (filial)
//!
//! `Visit` and `Opportunity` carry customer contact data and declare their
//! sensitive fields for the masking layer.

pub mod opportunity;
pub mod profile;
pub mod task;
pub mod visit;

pub use opportunity::Opportunity;
pub use profile::Profile;
pub use task::Task;
pub use visit::{ChecklistItem, Visit, VisitStatus};
