//! Hosted backend access.
//!
//! `BackendClient` talks to the hosted auth, REST, and realtime services. The
//! rest of the crate only sees it through the collaborator traits in
//! [`store`], [`crate::auth::AuthProvider`] and
//! [`crate::cache::BroadcastPublisher`].
//!
//! Requests carry the project `apikey` header plus a bearer token: the user's
//! access token when signed in, the anon key otherwise.

pub mod client;
pub mod error;
pub mod store;

pub use client::BackendClient;
pub use error::ApiError;
pub use store::{RecordStore, RoleStore};
