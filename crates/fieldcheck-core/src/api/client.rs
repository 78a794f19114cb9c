//! Client for the hosted backend: password and refresh-token auth, REST table
//! reads, and realtime broadcast publishing.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{ApiError, RecordStore, RoleStore};
use crate::access::RoleAssignment;
use crate::auth::{AuthEvent, AuthProvider, AuthUser, Session};
use crate::cache::{BroadcastMessage, BroadcastPublisher};
use crate::config::Config;
use crate::models::{Opportunity, Profile, Task, Visit};
use crate::utils::lock;

// ============================================================================
// Constants
// ============================================================================

/// HTTP request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
const INITIAL_BACKOFF_MS: u64 = 1000;

/// Token lifetime assumed when the auth service omits one.
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;

const AUTH_EVENT_BUFFER: usize = 16;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    /// Unix seconds.
    #[serde(default)]
    expires_at: Option<i64>,
    user: AuthUser,
}

impl TokenResponse {
    fn into_session(self) -> Session {
        let issued_at = Utc::now();
        let expires_at = self
            .expires_at
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single())
            .unwrap_or_else(|| {
                issued_at
                    + ChronoDuration::seconds(self.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS))
            });
        Session {
            access_token: self.access_token,
            refresh_token: self.refresh_token,
            user: self.user,
            issued_at,
            expires_at,
        }
    }
}

/// Decode a list body row by row, skipping rows that do not match `T`.
fn decode_rows<T: DeserializeOwned>(table: &str, body: Value) -> Vec<T> {
    let Value::Array(rows) = body else {
        warn!(table, "Expected a row array, treating as empty");
        return Vec::new();
    };
    let total = rows.len();
    let decoded: Vec<T> = rows
        .into_iter()
        .enumerate()
        .filter_map(|(index, row)| match serde_json::from_value(row) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(table, index, error = %e, "Skipping malformed row");
                None
            }
        })
        .collect();
    debug!(table, total, kept = decoded.len(), "Decoded rows");
    decoded
}

/// Backend client. Clone is cheap and clones share auth state.
#[derive(Clone)]
pub struct BackendClient {
    client: Client,
    base_url: String,
    anon_key: String,
    session: Arc<Mutex<Option<Session>>>,
    /// Serializes token refreshes.
    refresh: Arc<tokio::sync::Mutex<()>>,
    events: broadcast::Sender<AuthEvent>,
    initial_backoff: Duration,
}

impl std::fmt::Debug for BackendClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendClient")
            .field("base_url", &self.base_url)
            .field("signed_in", &lock(&self.session).is_some())
            .finish()
    }
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>, anon_key: impl Into<String>) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;
        let (events, _) = broadcast::channel(AUTH_EVENT_BUFFER);

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            anon_key: anon_key.into(),
            session: Arc::new(Mutex::new(None)),
            refresh: Arc::new(tokio::sync::Mutex::new(())),
            events,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
        })
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let (url, key) = config.backend()?;
        Ok(Self::new(url, key)?)
    }

    /// Overrides the initial rate-limit backoff (tests use a few milliseconds).
    pub fn with_backoff(mut self, initial: Duration) -> Self {
        self.initial_backoff = initial;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn bearer<'a>(&'a self, session: Option<&'a Session>) -> &'a str {
        session.map(|s| s.access_token.as_str()).unwrap_or(&self.anon_key)
    }

    // ===== Transport =====

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: Response) -> Result<Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    /// Send a request built by `build`, retrying 429 responses with
    /// exponential backoff.
    async fn execute<F>(&self, build: F) -> Result<Response, ApiError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut retries = 0;
        let mut backoff = self.initial_backoff;

        loop {
            let response = build().header("apikey", &self.anon_key).send().await?;
            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Self::check_response(response).await;
            }

            retries += 1;
            if retries > MAX_RATE_LIMIT_RETRIES {
                return Err(ApiError::RateLimited);
            }
            warn!(retry = retries, backoff_ms = backoff.as_millis() as u64, "Rate limited, backing off");
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
    }

    async fn get_rows<T: DeserializeOwned>(
        &self,
        table: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, ApiError> {
        let session = self.valid_session().await?;
        let token = self.bearer(session.as_ref());
        let url = self.url(&format!("/rest/v1/{}", table));

        let response = match self
            .execute(|| self.client.get(&url).bearer_auth(token).query(query))
            .await
        {
            Ok(response) => response,
            Err(ApiError::AccessDenied(reason)) => {
                warn!(table, reason = %reason, "Row access denied, treating as empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let text = response.text().await?;
        match serde_json::from_str::<Value>(&text) {
            Ok(body) => Ok(decode_rows(table, body)),
            Err(e) => {
                warn!(table, error = %e, "Malformed response body, treating as empty");
                Ok(Vec::new())
            }
        }
    }

    // ===== Auth =====

    async fn token_grant(&self, grant: &str, body: Value) -> Result<Session, ApiError> {
        let url = self.url("/auth/v1/token");
        let response = self
            .execute(|| self.client.post(&url).query(&[("grant_type", grant)]).json(&body))
            .await?;
        let token: TokenResponse = response.json().await?;
        Ok(token.into_session())
    }

    fn install(&self, event: AuthEvent) {
        *lock(&self.session) = event.session().cloned();
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    pub async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<Session, ApiError> {
        let session = self
            .token_grant("password", json!({ "email": email, "password": password }))
            .await?;
        info!(user_id = %session.user.id, "Signed in");
        self.install(AuthEvent::SignedIn(session.clone()));
        Ok(session)
    }

    /// Start a session from a stored refresh token.
    pub async fn restore_session(&self, refresh_token: &str) -> Result<Session, ApiError> {
        let session = self
            .token_grant("refresh_token", json!({ "refresh_token": refresh_token }))
            .await?;
        info!(user_id = %session.user.id, "Session restored");
        self.install(AuthEvent::SignedIn(session.clone()));
        Ok(session)
    }

    pub fn set_session(&self, session: Session) {
        self.install(AuthEvent::SignedIn(session));
    }

    /// Held session without refreshing it.
    pub fn current_session(&self) -> Option<Session> {
        lock(&self.session).clone()
    }

    /// Held session, refreshed first when it is close to expiry. A rejected
    /// refresh token ends the session.
    pub async fn valid_session(&self) -> Result<Option<Session>, ApiError> {
        match self.current_session() {
            Some(session) if !session.needs_refresh() => return Ok(Some(session)),
            None => return Ok(None),
            Some(_) => {}
        }

        let _guard = self.refresh.lock().await;
        // Another caller may have refreshed while we waited.
        let session = match self.current_session() {
            Some(session) if !session.needs_refresh() => return Ok(Some(session)),
            None => return Ok(None),
            Some(session) => session,
        };

        debug!(user_id = %session.user.id, "Refreshing access token");
        match self
            .token_grant("refresh_token", json!({ "refresh_token": session.refresh_token }))
            .await
        {
            Ok(refreshed) => {
                self.install(AuthEvent::TokenRefreshed(refreshed.clone()));
                Ok(Some(refreshed))
            }
            Err(e) if e.is_auth_error() => {
                warn!(error = %e, "Refresh token rejected, signing out");
                self.install(AuthEvent::SignedOut);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// End the session remotely (best effort) and locally.
    pub async fn sign_out(&self) {
        if let Some(session) = self.current_session() {
            let url = self.url("/auth/v1/logout");
            let result = self
                .execute(|| self.client.post(&url).bearer_auth(&session.access_token))
                .await;
            if let Err(e) = result {
                warn!(error = %e, "Remote sign-out failed, clearing local session anyway");
            }
        }
        self.install(AuthEvent::SignedOut);
        info!("Signed out");
    }
}

#[async_trait]
impl AuthProvider for BackendClient {
    async fn get_session(&self) -> Result<Option<Session>, ApiError> {
        self.valid_session().await
    }

    async fn get_user(&self) -> Result<Option<AuthUser>, ApiError> {
        let Some(session) = self.valid_session().await? else {
            return Ok(None);
        };
        let url = self.url("/auth/v1/user");
        match self
            .execute(|| self.client.get(&url).bearer_auth(&session.access_token))
            .await
        {
            Ok(response) => Ok(Some(response.json().await?)),
            Err(ApiError::Unauthorized) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }
}

#[async_trait]
impl RoleStore for BackendClient {
    async fn fetch_roles(&self, user_id: &str) -> Result<Vec<RoleAssignment>, ApiError> {
        self.get_rows(
            "user_roles",
            &[
                ("select", "user_id,role".to_string()),
                ("user_id", format!("eq.{}", user_id)),
            ],
        )
        .await
    }

    async fn fetch_profile(&self, user_id: &str) -> Result<Option<Profile>, ApiError> {
        let rows: Vec<Profile> = self
            .get_rows(
                "profiles",
                &[
                    ("select", "id,full_name,email,filial".to_string()),
                    ("id", format!("eq.{}", user_id)),
                    ("limit", "1".to_string()),
                ],
            )
            .await?;
        Ok(rows.into_iter().next())
    }
}

#[async_trait]
impl RecordStore for BackendClient {
    async fn fetch_visits(&self) -> Result<Vec<Visit>, ApiError> {
        self.get_rows(
            "visits",
            &[("select", "*".to_string()), ("order", "visited_at.desc".to_string())],
        )
        .await
    }

    async fn fetch_opportunities(&self) -> Result<Vec<Opportunity>, ApiError> {
        self.get_rows("opportunities", &[("select", "*".to_string())]).await
    }

    async fn fetch_tasks(&self) -> Result<Vec<Task>, ApiError> {
        self.get_rows(
            "tasks",
            &[("select", "*".to_string()), ("order", "due_date.asc".to_string())],
        )
        .await
    }
}

#[async_trait]
impl BroadcastPublisher for BackendClient {
    async fn send(&self, message: BroadcastMessage) -> Result<(), ApiError> {
        let session = self.valid_session().await?;
        let token = self.bearer(session.as_ref());
        let url = self.url("/realtime/v1/api/broadcast");
        let body = json!({
            "messages": [{
                "topic": message.channel,
                "event": message.event,
                "payload": message.payload,
            }]
        });
        self.execute(|| self.client.post(&url).bearer_auth(token).json(&body))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::Role;
    use crate::auth::session::tests::session_for;
    use crate::cache::{INVALIDATION_CHANNEL, INVALIDATION_EVENT};
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_client(uri: &str) -> BackendClient {
        BackendClient::new(uri, "anon-key")
            .unwrap()
            .with_backoff(Duration::from_millis(1))
    }

    fn token_body(access: &str, user_id: &str) -> Value {
        json!({
            "access_token": access,
            "token_type": "bearer",
            "expires_in": 3600,
            "expires_at": Utc::now().timestamp() + 3600,
            "refresh_token": format!("refresh-{access}"),
            "user": {"id": user_id, "email": format!("{user_id}@example.com"), "aud": "authenticated"}
        })
    }

    #[tokio::test]
    async fn test_sign_in_stores_session_and_emits_event() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "password"))
            .and(header("apikey", "anon-key"))
            .and(body_partial_json(json!({"email": "ana@example.com"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("access-1", "u1")))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let mut events = client.subscribe();
        let session = client.sign_in_with_password("ana@example.com", "secret").await.unwrap();

        assert_eq!(session.user.id, "u1");
        assert_eq!(session.access_token, "access-1");
        assert!(!session.needs_refresh());
        assert_eq!(client.current_session(), Some(session.clone()));
        assert_eq!(events.try_recv().unwrap(), AuthEvent::SignedIn(session));
    }

    #[tokio::test]
    async fn test_invalid_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(
                json!({"error": "invalid_grant", "error_description": "Invalid login credentials"}),
            ))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let err = client.sign_in_with_password("ana@example.com", "wrong").await.unwrap_err();
        assert_eq!(err, ApiError::InvalidCredentials);
        assert!(client.current_session().is_none());
    }

    #[tokio::test]
    async fn test_rate_limited_then_success() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/user_roles"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/user_roles"))
            .and(query_param("user_id", "eq.u1"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([{"user_id": "u1", "role": "supervisor"}])),
            )
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        client.set_session(session_for("u1"));
        let roles = client.fetch_roles("u1").await.unwrap();
        assert_eq!(
            roles,
            vec![RoleAssignment {
                user_id: "u1".into(),
                role: Role::Supervisor
            }]
        );
    }

    #[tokio::test]
    async fn test_rate_limit_exhausted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/tasks"))
            .respond_with(ResponseTemplate::new(429))
            .expect(u64::from(MAX_RATE_LIMIT_RETRIES) + 1)
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        assert_eq!(client.fetch_tasks().await.unwrap_err(), ApiError::RateLimited);
    }

    #[tokio::test]
    async fn test_malformed_rows_skipped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/visits"))
            .and(header("authorization", "Bearer token-u1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "v1", "customer_name": "Padaria Central", "consultant_id": "u1"},
                {"id": 5},
                {"id": "v3", "customer_name": "Loja Norte", "checklist": [{"label": "Stock"}]}
            ])))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        client.set_session(session_for("u1"));
        let visits = client.fetch_visits().await.unwrap();
        let ids: Vec<&str> = visits.iter().map(|v| v.id.as_str()).collect();
        assert_eq!(ids, vec!["v1", "v3"]);
    }

    #[tokio::test]
    async fn test_signed_out_uses_anon_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/opportunities"))
            .and(header("authorization", "Bearer anon-key"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        assert!(client.fetch_opportunities().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_row_access_denied_is_empty() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/rest/v1/profiles"))
            .respond_with(ResponseTemplate::new(403).set_body_string("permission denied for table profiles"))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        assert_eq!(client.fetch_profile("u1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_refreshes_near_expiry() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .and(query_param("grant_type", "refresh_token"))
            .and(body_partial_json(json!({"refresh_token": "refresh-u1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(token_body("access-2", "u1")))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let mut session = session_for("u1");
        session.expires_at = Utc::now() + ChronoDuration::seconds(30);
        client.set_session(session);
        let mut events = client.subscribe();

        let refreshed = client.get_session().await.unwrap().unwrap();
        assert_eq!(refreshed.access_token, "access-2");
        // already fresh, no second refresh
        assert_eq!(client.get_session().await.unwrap().unwrap().access_token, "access-2");
        assert!(matches!(events.try_recv().unwrap(), AuthEvent::TokenRefreshed(_)));
    }

    #[tokio::test]
    async fn test_rejected_refresh_signs_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({"error": "invalid_grant"})))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let mut session = session_for("u1");
        session.expires_at = Utc::now() - ChronoDuration::seconds(5);
        client.set_session(session);
        let mut events = client.subscribe();

        assert_eq!(client.get_session().await.unwrap(), None);
        assert_eq!(events.try_recv().unwrap(), AuthEvent::SignedOut);
        assert_eq!(client.get_user().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_transient_refresh_failure_is_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/token"))
            .respond_with(ResponseTemplate::new(503).set_body_string("upstream unavailable"))
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        let mut session = session_for("u1");
        session.expires_at = Utc::now() + ChronoDuration::seconds(10);
        client.set_session(session);

        let err = client.get_session().await.unwrap_err();
        assert!(err.is_transient());
        // still held for a later attempt
        assert!(client.current_session().is_some());
    }

    #[tokio::test]
    async fn test_publish_broadcast() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/realtime/v1/api/broadcast"))
            .and(body_partial_json(json!({
                "messages": [{
                    "topic": INVALIDATION_CHANNEL,
                    "event": INVALIDATION_EVENT,
                    "payload": {"type": "tasks"}
                }]
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        client.set_session(session_for("a1"));
        let message = BroadcastMessage {
            channel: INVALIDATION_CHANNEL.to_string(),
            event: INVALIDATION_EVENT.to_string(),
            payload: json!({"type": "tasks", "timestamp": 1, "source": "s1"}),
        };
        BroadcastPublisher::send(&client, message).await.unwrap();
    }

    #[tokio::test]
    async fn test_sign_out_clears_even_if_remote_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/auth/v1/logout"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server.uri());
        client.set_session(session_for("u1"));
        let mut events = client.subscribe();
        client.sign_out().await;

        assert!(client.current_session().is_none());
        assert_eq!(events.try_recv().unwrap(), AuthEvent::SignedOut);
    }

    #[test]
    fn test_token_response_without_expires_at() {
        let token: TokenResponse = serde_json::from_value(json!({
            "access_token": "a", "refresh_token": "r", "expires_in": 120,
            "user": {"id": "u1"}
        }))
        .unwrap();
        let session = token.into_session();
        assert_eq!(session.user.email, None);
        let lifetime = (session.expires_at - session.issued_at).num_seconds();
        assert_eq!(lifetime, 120);
    }
}
