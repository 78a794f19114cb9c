use async_trait::async_trait;
use tokio::sync::broadcast;

use super::session::{AuthUser, Session};
use crate::api::ApiError;

/// Session-change notifications from the authentication collaborator.
#[derive(Debug, Clone, PartialEq)]
pub enum AuthEvent {
    SignedIn(Session),
    TokenRefreshed(Session),
    SignedOut,
}

impl AuthEvent {
    /// The session in effect after this event.
    pub fn session(&self) -> Option<&Session> {
        match self {
            AuthEvent::SignedIn(s) | AuthEvent::TokenRefreshed(s) => Some(s),
            AuthEvent::SignedOut => None,
        }
    }
}

/// Authentication collaborator. Credentials and tokens are opaque to the core.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Current session, `None` when signed out.
    async fn get_session(&self) -> Result<Option<Session>, ApiError>;

    /// Current user as confirmed by the auth service.
    async fn get_user(&self) -> Result<Option<AuthUser>, ApiError>;

    /// Session-change events (sign-in, sign-out, token refresh).
    fn subscribe(&self) -> broadcast::Receiver<AuthEvent>;
}
