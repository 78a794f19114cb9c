use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::provider::{AuthEvent, AuthProvider};
use crate::cache::RequestDeduplicator;
use crate::storage::{self, KeyValueStore};
use crate::utils::lock;

/// How long a looked-up session is trusted before asking the auth
/// collaborator again. Unrelated to the token's own expiry.
pub const SESSION_CACHE_TTL: StdDuration = StdDuration::from_secs(30);

/// Refresh tokens this close to expiry.
const TOKEN_REFRESH_BUFFER_SECS: i64 = 60;

/// Local storage key for the last time a session was seen.
pub const LAST_SESSION_KEY: &str = "last_session_at";

const SESSION_LOOKUP_KEY: &str = "auth:session";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct AuthUser {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: String,
    pub user: AuthUser,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Check if the session will expire soon and should be refreshed
    pub fn needs_refresh(&self) -> bool {
        Utc::now() > self.expires_at - Duration::seconds(TOKEN_REFRESH_BUFFER_SECS)
    }

    pub fn time_until_expiry(&self) -> Duration {
        self.expires_at - Utc::now()
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> i64 {
        self.time_until_expiry().num_minutes().max(0)
    }
}

struct CachedSession {
    session: Option<Session>,
    fetched_at: Instant,
}

struct CacheState {
    entry: Option<CachedSession>,
    /// Bumped by every session-change event; lookups that started under an
    /// older generation must not overwrite the event's session.
    generation: u64,
}

/// In-memory session cache with a short time-to-live.
///
/// Concurrent lookups are collapsed into one call to the auth collaborator.
/// Session-change events replace the cached value immediately, bypassing the TTL.
pub struct SessionCache {
    provider: Arc<dyn AuthProvider>,
    state: Mutex<CacheState>,
    lookups: RequestDeduplicator<Option<Session>>,
    store: Option<Arc<dyn KeyValueStore>>,
    ttl: StdDuration,
}

impl SessionCache {
    pub fn new(provider: Arc<dyn AuthProvider>) -> Self {
        Self::with_ttl(provider, SESSION_CACHE_TTL)
    }

    pub fn with_ttl(provider: Arc<dyn AuthProvider>, ttl: StdDuration) -> Self {
        Self {
            provider,
            state: Mutex::new(CacheState {
                entry: None,
                generation: 0,
            }),
            lookups: RequestDeduplicator::new(),
            store: None,
            ttl,
        }
    }

    /// Record when a session was last seen in persistent local storage.
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Current session. Served from cache while younger than the TTL; otherwise
    /// looked up again. A failed lookup degrades to the last known session.
    pub async fn get_session(&self) -> Option<Session> {
        let generation = {
            let state = lock(&self.state);
            if let Some(ref cached) = state.entry {
                if cached.fetched_at.elapsed() < self.ttl {
                    return cached.session.clone();
                }
            }
            state.generation
        };

        // Lookups started before a clear or event are not joined.
        let lookup_key = format!("{}#{}", SESSION_LOOKUP_KEY, generation);
        let provider = Arc::clone(&self.provider);
        let result = self
            .lookups
            .run(&lookup_key, move || async move { provider.get_session().await })
            .await;

        let mut state = lock(&self.state);
        match result {
            Ok(session) if state.generation == generation => {
                debug!(signed_in = session.is_some(), "Session looked up");
                state.entry = Some(CachedSession {
                    session: session.clone(),
                    fetched_at: Instant::now(),
                });
                drop(state);
                self.record_seen(session.as_ref());
                session
            }
            Ok(_) => {
                debug!("Session changed during lookup, keeping event session");
                state.entry.as_ref().and_then(|c| c.session.clone())
            }
            Err(e) => {
                let fallback = state.entry.as_ref().and_then(|c| c.session.clone());
                warn!(error = %e, has_fallback = fallback.is_some(), "Session lookup failed");
                fallback
            }
        }
    }

    /// Apply a session-change event immediately, regardless of TTL.
    pub fn apply_event(&self, event: &AuthEvent) {
        let session = event.session().cloned();
        {
            let mut state = lock(&self.state);
            state.generation += 1;
            state.entry = Some(CachedSession {
                session: session.clone(),
                fetched_at: Instant::now(),
            });
        }
        debug!(signed_in = session.is_some(), "Session cache updated from auth event");
        self.record_seen(session.as_ref());
    }

    /// Forget the cached session; the next call looks it up again.
    pub fn clear(&self) {
        let mut state = lock(&self.state);
        state.generation += 1;
        state.entry = None;
    }

    /// Follow the collaborator's session-change events until it stops
    /// publishing or the handle is aborted.
    pub fn spawn_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.provider.subscribe();
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => cache.apply_event(&event),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Missed auth events, dropping cached session");
                        cache.clear();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Last time a session was seen, from persistent storage.
    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        let store = self.store.as_ref()?;
        match storage::load_json(store.as_ref(), LAST_SESSION_KEY) {
            Ok(at) => at,
            Err(e) => {
                debug!(error = %e, "Failed to read last session timestamp");
                None
            }
        }
    }

    fn record_seen(&self, session: Option<&Session>) {
        let (Some(store), Some(_)) = (self.store.as_ref(), session) else {
            return;
        };
        if let Err(e) = storage::save_json(store.as_ref(), LAST_SESSION_KEY, &Utc::now()) {
            debug!(error = %e, "Failed to persist last session timestamp");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::api::ApiError;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::broadcast;

    pub(crate) fn session_for(user_id: &str) -> Session {
        Session {
            access_token: format!("token-{user_id}"),
            refresh_token: format!("refresh-{user_id}"),
            user: AuthUser {
                id: user_id.to_string(),
                email: Some(format!("{user_id}@example.com")),
            },
            issued_at: Utc::now(),
            expires_at: Utc::now() + Duration::hours(1),
        }
    }

    /// Auth collaborator double with a scripted session and call counter.
    pub(crate) struct FakeAuth {
        pub session: Mutex<Result<Option<Session>, ApiError>>,
        pub lookups: AtomicUsize,
        pub delay: StdDuration,
        pub events: broadcast::Sender<AuthEvent>,
    }

    impl FakeAuth {
        pub(crate) fn signed_in(user_id: &str) -> Self {
            Self::with(Ok(Some(session_for(user_id))))
        }

        pub(crate) fn with(session: Result<Option<Session>, ApiError>) -> Self {
            Self {
                session: Mutex::new(session),
                lookups: AtomicUsize::new(0),
                delay: StdDuration::ZERO,
                events: broadcast::channel(8).0,
            }
        }

        pub(crate) fn lookups(&self) -> usize {
            self.lookups.load(Ordering::SeqCst)
        }

        pub(crate) fn set(&self, session: Result<Option<Session>, ApiError>) {
            *lock(&self.session) = session;
        }
    }

    #[async_trait]
    impl AuthProvider for FakeAuth {
        async fn get_session(&self) -> Result<Option<Session>, ApiError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            lock(&self.session).clone()
        }

        async fn get_user(&self) -> Result<Option<AuthUser>, ApiError> {
            lock(&self.session).clone().map(|s| s.map(|s| s.user))
        }

        fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
            self.events.subscribe()
        }
    }

    #[test]
    fn test_session_expiry() {
        let mut session = session_for("u1");
        assert!(!session.is_expired());
        assert!(!session.needs_refresh());
        assert!(session.minutes_until_expiry() >= 59);

        session.expires_at = Utc::now() + Duration::seconds(30);
        assert!(session.needs_refresh());
        assert!(!session.is_expired());

        session.expires_at = Utc::now() - Duration::seconds(1);
        assert!(session.is_expired());
        assert_eq!(session.minutes_until_expiry(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_boundary() {
        let auth = Arc::new(FakeAuth::signed_in("u1"));
        let cache = SessionCache::new(auth.clone());

        let first = cache.get_session().await;
        tokio::time::advance(StdDuration::from_secs(29)).await;
        let second = cache.get_session().await;
        assert_eq!(first, second);
        assert_eq!(auth.lookups(), 1);

        tokio::time::advance(StdDuration::from_secs(2)).await;
        let _ = cache.get_session().await;
        assert_eq!(auth.lookups(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_lookups_collapse() {
        let mut fake = FakeAuth::signed_in("u1");
        fake.delay = StdDuration::from_millis(50);
        let auth = Arc::new(fake);
        let cache = SessionCache::new(auth.clone());

        let (a, b, c) = tokio::join!(cache.get_session(), cache.get_session(), cache.get_session());
        assert!(a.is_some());
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(auth.lookups(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_failure_falls_back_to_last_known() {
        let auth = Arc::new(FakeAuth::signed_in("u1"));
        let cache = SessionCache::new(auth.clone());
        let known = cache.get_session().await;

        auth.set(Err(ApiError::Network("offline".into())));
        tokio::time::advance(StdDuration::from_secs(31)).await;
        assert_eq!(cache.get_session().await, known);

        // Failure does not refresh the timestamp: the next call tries again.
        let _ = cache.get_session().await;
        assert_eq!(auth.lookups(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_failure_without_cache_is_absent() {
        let auth = Arc::new(FakeAuth::with(Err(ApiError::Network("offline".into()))));
        let cache = SessionCache::new(auth);
        assert_eq!(cache.get_session().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_bypass_ttl() {
        let auth = Arc::new(FakeAuth::signed_in("u1"));
        let cache = Arc::new(SessionCache::new(auth.clone()));
        let _listener = cache.spawn_listener();
        assert!(cache.get_session().await.is_some());

        auth.events.send(AuthEvent::SignedOut).unwrap();
        tokio::time::sleep(StdDuration::from_millis(1)).await;
        assert_eq!(cache.get_session().await, None);

        let next = session_for("u2");
        auth.events.send(AuthEvent::SignedIn(next.clone())).unwrap();
        tokio::time::sleep(StdDuration::from_millis(1)).await;
        assert_eq!(cache.get_session().await, Some(next));
        assert_eq!(auth.lookups(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_during_lookup_wins() {
        let mut fake = FakeAuth::signed_in("u1");
        fake.delay = StdDuration::from_millis(50);
        let auth = Arc::new(fake);
        let cache = SessionCache::new(auth.clone());

        let (looked_up, _) = tokio::join!(cache.get_session(), async {
            tokio::time::sleep(StdDuration::from_millis(10)).await;
            cache.apply_event(&AuthEvent::SignedOut);
        });

        assert_eq!(looked_up, None);
        assert_eq!(cache.get_session().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_after_clear_does_not_join_earlier_one() {
        let mut fake = FakeAuth::signed_in("u1");
        fake.delay = StdDuration::from_millis(50);
        let auth = Arc::new(fake);
        let cache = SessionCache::new(auth.clone());

        let (first, second) = tokio::join!(cache.get_session(), async {
            tokio::time::sleep(StdDuration::from_millis(10)).await;
            auth.set(Ok(Some(session_for("u2"))));
            cache.clear();
            cache.get_session().await
        });

        assert_eq!(auth.lookups(), 2);
        assert_eq!(second.map(|s| s.user.id), Some("u2".to_string()));
        // a lookup overtaken by the clear reports the cleared state
        assert_eq!(first, None);
        assert_eq!(cache.get_session().await.map(|s| s.user.id), Some("u2".to_string()));
        assert_eq!(auth.lookups(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_records_last_seen() {
        let store = Arc::new(MemoryStore::new());
        let cache = SessionCache::new(Arc::new(FakeAuth::signed_in("u1"))).with_store(store);
        assert!(cache.last_seen().is_none());
        let _ = cache.get_session().await;
        assert!(cache.last_seen().is_some());
    }
}
