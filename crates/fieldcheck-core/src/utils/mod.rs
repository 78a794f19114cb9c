//! Small helpers shared across the crate.

pub mod format;
pub mod sync;

pub use format::age_display;
pub(crate) use sync::lock;
