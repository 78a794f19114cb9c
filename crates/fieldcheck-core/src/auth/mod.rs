//! Authentication: session types, the auth collaborator seam, and the
//! short-lived session cache.
//!
//! This module provides:
//! - `Session`: opaque token bundle with issuance and expiry times
//! - `SessionCache`: 30-second cache in front of the auth collaborator,
//!   updated immediately by session-change events
//! - `AuthProvider`: the collaborator trait (session lookup, user lookup, events)
//! - `CredentialStore`: refresh tokens in the OS keychain via keyring

pub mod credentials;
pub mod provider;
pub mod session;

pub use credentials::CredentialStore;
pub use provider::{AuthEvent, AuthProvider};
pub use session::{AuthUser, Session, SessionCache, LAST_SESSION_KEY, SESSION_CACHE_TTL};
