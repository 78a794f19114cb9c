//! The sync context: one signed-in client's caches, policy, and background
//! listeners, wired to the backend collaborators.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::access::{mask_all, AccessPolicyResolver, MaskedRecord, Requester, RoleInfo};
use crate::api::{ApiError, BackendClient, RecordStore, RoleStore};
use crate::auth::{AuthEvent, AuthProvider, AuthUser, SessionCache};
use crate::cache::{
    BroadcastPublisher, BroadcastSubscriber, InvalidationBroadcaster, InvalidationKind, LocalHub,
    QueryCache, QueryKey, QueryOptions,
};
use crate::models::{Opportunity, Task, Visit};
use crate::storage::KeyValueStore;
use crate::utils::lock;
use crate::version::{VersionCheck, VersionWatcher};

/// How often unobserved, expired query entries are swept.
const GC_INTERVAL: Duration = Duration::from_secs(60);

const VISITS_KEY: &str = "visits";
const OPPORTUNITIES_KEY: &str = "opportunities";
const TASKS_KEY: &str = "tasks";

static NEXT_SOURCE: AtomicU64 = AtomicU64::new(0);

/// Unique id for this session on the invalidation channel.
fn session_source() -> String {
    format!(
        "{}-{}-{}",
        std::process::id(),
        Utc::now().timestamp_millis(),
        NEXT_SOURCE.fetch_add(1, Ordering::Relaxed)
    )
}

/// Collaborators a context talks to.
#[derive(Clone)]
pub struct Backend {
    pub auth: Arc<dyn AuthProvider>,
    pub roles: Arc<dyn RoleStore>,
    pub records: Arc<dyn RecordStore>,
    pub publisher: Arc<dyn BroadcastPublisher>,
    pub subscriber: Arc<dyn BroadcastSubscriber>,
    pub store: Arc<dyn KeyValueStore>,
}

impl Backend {
    /// Hosted backend for auth, records, and publishing. Incoming broadcasts
    /// arrive through `hub`.
    pub fn hosted(client: BackendClient, hub: Arc<LocalHub>, store: Arc<dyn KeyValueStore>) -> Self {
        let client = Arc::new(client);
        Self {
            auth: client.clone(),
            roles: client.clone(),
            records: client.clone(),
            publisher: client,
            subscriber: hub,
            store,
        }
    }
}

pub struct SyncContext {
    records: Arc<dyn RecordStore>,
    sessions: Arc<SessionCache>,
    queries: QueryCache,
    policy: AccessPolicyResolver,
    broadcaster: InvalidationBroadcaster,
    versions: VersionWatcher,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncContext {
    /// Build the caches and start background listeners. Must be called from
    /// within a tokio runtime.
    pub fn start(backend: Backend) -> Self {
        let queries = QueryCache::new();
        let sessions = Arc::new(
            SessionCache::new(Arc::clone(&backend.auth)).with_store(Arc::clone(&backend.store)),
        );
        let policy = AccessPolicyResolver::new(Arc::clone(&backend.roles), queries.clone());
        let broadcaster =
            InvalidationBroadcaster::new(Arc::clone(&backend.publisher), queries.clone(), session_source());

        let tasks = vec![
            sessions.spawn_listener(),
            broadcaster.subscribe(backend.subscriber.as_ref()),
            spawn_auth_listener(backend.auth.as_ref(), queries.clone()),
            queries.spawn_gc(GC_INTERVAL),
        ];
        info!(source = %broadcaster.source(), "Sync context started");

        Self {
            records: backend.records,
            sessions,
            queries,
            policy,
            broadcaster,
            versions: VersionWatcher::new(backend.store),
            tasks: Mutex::new(tasks),
        }
    }

    pub fn queries(&self) -> &QueryCache {
        &self.queries
    }

    pub fn sessions(&self) -> &SessionCache {
        &self.sessions
    }

    pub fn policy(&self) -> &AccessPolicyResolver {
        &self.policy
    }

    pub fn broadcaster(&self) -> &InvalidationBroadcaster {
        &self.broadcaster
    }

    pub async fn current_user(&self) -> Option<AuthUser> {
        self.sessions.get_session().await.map(|s| s.user)
    }

    pub async fn role_info(&self) -> RoleInfo {
        let user = self.current_user().await;
        self.policy.resolve_role(user.as_ref()).await
    }

    pub async fn requester(&self) -> Option<Requester> {
        let user = self.current_user().await;
        self.policy.requester(user.as_ref()).await
    }

    async fn signed_in_user(&self) -> Result<AuthUser, ApiError> {
        self.current_user().await.ok_or(ApiError::Unauthorized)
    }

    async fn load<T, F, Fut>(&self, key: QueryKey, fetch: F) -> Result<Vec<T>, ApiError>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(Arc<dyn RecordStore>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<T>, ApiError>> + Send + 'static,
    {
        let records = Arc::clone(&self.records);
        self.queries
            .fetch(&key, move || fetch(Arc::clone(&records)), &QueryOptions::default())
            .await
    }

    /// Visits, each masked for the tier the current user has on it.
    pub async fn visits(&self) -> Result<Vec<MaskedRecord<Visit>>, ApiError> {
        let user = self.signed_in_user().await?;
        let visits = self
            .load(QueryKey::new([VISITS_KEY, user.id.as_str()]), |store| async move {
                store.fetch_visits().await
            })
            .await?;
        Ok(self.mask_for(&user, &visits).await)
    }

    pub async fn opportunities(&self) -> Result<Vec<MaskedRecord<Opportunity>>, ApiError> {
        let user = self.signed_in_user().await?;
        let opportunities = self
            .load(QueryKey::new([OPPORTUNITIES_KEY, user.id.as_str()]), |store| async move {
                store.fetch_opportunities().await
            })
            .await?;
        Ok(self.mask_for(&user, &opportunities).await)
    }

    /// Tasks carry no sensitive fields and are returned as stored.
    pub async fn tasks(&self) -> Result<Vec<Task>, ApiError> {
        let user = self.signed_in_user().await?;
        self.load(QueryKey::new([TASKS_KEY, user.id.as_str()]), |store| async move {
            store.fetch_tasks().await
        })
        .await
    }

    async fn mask_for<T>(&self, user: &AuthUser, records: &[T]) -> Vec<MaskedRecord<T>>
    where
        T: crate::access::Maskable + crate::access::OwnedResource,
    {
        let role = self.policy.resolve_role(Some(user)).await;
        let requester = self.policy.requester(Some(user)).await;
        mask_all(records, requester.as_ref(), &role)
    }

    /// Broadcast an invalidation to every session. Administrators only.
    pub async fn publish_invalidation(&self, kind: InvalidationKind) -> Result<(), ApiError> {
        let role = self.role_info().await;
        if !role.is_admin {
            warn!(role = %role.role, %kind, "Invalidation broadcast refused");
            return Err(ApiError::AccessDenied(
                "only administrators can broadcast cache invalidations".to_string(),
            ));
        }
        self.broadcaster.publish(kind).await;
        Ok(())
    }

    /// Compare the running build with the stored marker. A new build
    /// invalidates everything cached so far.
    pub fn check_version(&self) -> VersionCheck {
        let check = self.versions.check_version();
        if check.should_update {
            let count = self.queries.invalidate_all();
            info!(count, "Invalidated queries after build update");
        }
        check
    }

    pub fn on_window_focus(&self) -> Vec<QueryKey> {
        self.queries.on_window_focus()
    }

    pub fn on_reconnect(&self) -> Vec<QueryKey> {
        self.queries.on_reconnect()
    }

    /// Forget every cached session and query.
    pub fn sign_out(&self) {
        self.sessions.clear();
        self.queries.clear();
        debug!("Sync context caches cleared");
    }

    /// Stop background listeners and clear every cache.
    pub fn shutdown(&self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        self.sign_out();
        info!("Sync context stopped");
    }
}

impl Drop for SyncContext {
    fn drop(&mut self) {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
    }
}

/// Keep query data consistent with the signed-in identity.
fn spawn_auth_listener(auth: &dyn AuthProvider, queries: QueryCache) -> JoinHandle<()> {
    let mut events = auth.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(AuthEvent::SignedOut) => {
                    debug!("Signed out, clearing queries");
                    queries.clear();
                }
                Ok(AuthEvent::SignedIn(_)) => {
                    queries.invalidate(&AccessPolicyResolver::role_prefix());
                    queries.invalidate(&AccessPolicyResolver::profile_prefix());
                }
                Ok(AuthEvent::TokenRefreshed(_)) => {}
                Err(RecvError::Lagged(missed)) => {
                    warn!(missed, "Missed auth events, invalidating queries");
                    queries.invalidate_all();
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::role::tests::FakeRoles;
    use crate::access::{AccessTier, Role, REDACTED};
    use crate::auth::session::tests::{session_for, FakeAuth};
    use crate::models::VisitStatus;
    use crate::storage::MemoryStore;
    use crate::version::VERSION_MARKER_KEY;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct FakeRecords {
        visits: Mutex<Vec<Visit>>,
        tasks: Mutex<Vec<Task>>,
        visit_calls: AtomicUsize,
        task_calls: AtomicUsize,
    }

    #[async_trait]
    impl RecordStore for FakeRecords {
        async fn fetch_visits(&self) -> Result<Vec<Visit>, ApiError> {
            self.visit_calls.fetch_add(1, Ordering::SeqCst);
            Ok(lock(&self.visits).clone())
        }

        async fn fetch_opportunities(&self) -> Result<Vec<Opportunity>, ApiError> {
            Ok(Vec::new())
        }

        async fn fetch_tasks(&self) -> Result<Vec<Task>, ApiError> {
            self.task_calls.fetch_add(1, Ordering::SeqCst);
            Ok(lock(&self.tasks).clone())
        }
    }

    struct Harness {
        auth: Arc<FakeAuth>,
        roles: Arc<FakeRoles>,
        records: Arc<FakeRecords>,
        hub: Arc<LocalHub>,
        store: Arc<MemoryStore>,
    }

    impl Harness {
        fn new(user_id: &str) -> Self {
            Self {
                auth: Arc::new(FakeAuth::signed_in(user_id)),
                roles: Arc::new(FakeRoles::default()),
                records: Arc::new(FakeRecords::default()),
                hub: LocalHub::new_shared(),
                store: Arc::new(MemoryStore::new()),
            }
        }

        /// Another signed-in user on the same transport and data.
        fn peer(&self, user_id: &str) -> Self {
            Self {
                auth: Arc::new(FakeAuth::signed_in(user_id)),
                roles: self.roles.clone(),
                records: self.records.clone(),
                hub: self.hub.clone(),
                store: Arc::new(MemoryStore::new()),
            }
        }

        fn start(&self) -> SyncContext {
            SyncContext::start(Backend {
                auth: self.auth.clone(),
                roles: self.roles.clone(),
                records: self.records.clone(),
                publisher: self.hub.clone(),
                subscriber: self.hub.clone(),
                store: self.store.clone(),
            })
        }
    }

    fn visit(id: &str, owner: &str, filial: &str) -> Visit {
        Visit {
            id: id.into(),
            customer_name: format!("Customer {id}"),
            customer_email: Some(format!("{id}@customer.com")),
            customer_phone: Some("11 5555-0000".into()),
            notes: Some("pays late".into()),
            consultant_id: Some(owner.into()),
            filial: Some(filial.into()),
            status: VisitStatus::Scheduled,
            visited_at: None,
            checklist: Vec::new(),
        }
    }

    fn task(id: &str) -> Task {
        Task {
            id: id.into(),
            title: "Follow up".into(),
            assigned_to: None,
            filial: None,
            opportunity_id: None,
            due_date: None,
            completed: false,
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_supervisor_tiers_by_filial() {
        let h = Harness::new("u1");
        h.roles.grant("u1", Role::Supervisor);
        h.roles.profile("u1", Some("SP"));
        *lock(&h.records.visits) = vec![visit("v1", "u2", "SP"), visit("v2", "u3", "RJ"), visit("v3", "u1", "RJ")];
        let ctx = h.start();

        let visits = ctx.visits().await.unwrap();
        let tiers: Vec<AccessTier> = visits.iter().map(|v| v.tier).collect();
        assert_eq!(tiers, vec![AccessTier::Supervisor, AccessTier::Limited, AccessTier::Owner]);
        assert!(!visits[0].is_masked);
        assert_eq!(visits[0].record.customer_email.as_deref(), Some("v1@customer.com"));
        assert!(visits[1].is_masked);
        assert_eq!(visits[1].record.notes.as_deref(), Some(REDACTED));
        // cached under the user's key
        ctx.visits().await.unwrap();
        assert_eq!(h.records.visit_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_signed_out_is_unauthorized() {
        let h = Harness::new("u1");
        h.auth.set(Ok(None));
        let ctx = h.start();

        assert_eq!(ctx.visits().await.unwrap_err(), ApiError::Unauthorized);
        assert_eq!(ctx.tasks().await.unwrap_err(), ApiError::Unauthorized);
        assert_eq!(ctx.role_info().await, RoleInfo::none());
        assert!(ctx.requester().await.is_none());
        assert_eq!(h.records.visit_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_publish_requires_admin() {
        let h = Harness::new("u1");
        h.roles.grant("u1", Role::Supervisor);
        let ctx = h.start();

        let err = ctx.publish_invalidation(InvalidationKind::Full).await.unwrap_err();
        assert!(matches!(err, ApiError::AccessDenied(_)));
    }

    #[tokio::test]
    async fn test_admin_invalidation_reaches_other_sessions() {
        let admin = Harness::new("a1");
        admin.roles.grant("a1", Role::Admin);
        *lock(&admin.records.tasks) = vec![task("t1")];
        let consultant = admin.peer("c1");
        consultant.roles.grant("c1", Role::Consultant);

        let admin_ctx = admin.start();
        let consultant_ctx = consultant.start();

        consultant_ctx.tasks().await.unwrap();
        let key = QueryKey::new([TASKS_KEY, "c1"]);
        assert_eq!(consultant_ctx.queries().is_stale(&key), Some(false));

        admin_ctx.publish_invalidation(InvalidationKind::Tasks).await.unwrap();
        let queries = consultant_ctx.queries().clone();
        eventually(|| queries.is_stale(&key) == Some(true)).await;

        *lock(&admin.records.tasks) = vec![task("t1"), task("t2")];
        assert_eq!(consultant_ctx.tasks().await.unwrap().len(), 2);
        assert_eq!(admin.records.task_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_sign_out_event_clears_queries() {
        let h = Harness::new("u1");
        *lock(&h.records.tasks) = vec![task("t1")];
        let ctx = h.start();
        ctx.tasks().await.unwrap();
        assert!(!ctx.queries().is_empty());

        h.auth.set(Ok(None));
        h.auth.events.send(AuthEvent::SignedOut).unwrap();
        let queries = ctx.queries().clone();
        eventually(|| queries.is_empty()).await;
        assert!(ctx.current_user().await.is_none());
    }

    #[tokio::test]
    async fn test_sign_in_event_refreshes_roles() {
        let h = Harness::new("u1");
        h.roles.grant("u1", Role::Consultant);
        let ctx = h.start();
        assert_eq!(ctx.role_info().await.role, Role::Consultant);

        h.roles.grant("u1", Role::Admin);
        h.auth.events.send(AuthEvent::SignedIn(session_for("u1"))).unwrap();
        let queries = ctx.queries().clone();
        let key = AccessPolicyResolver::role_key("u1");
        eventually(|| queries.is_stale(&key) == Some(true)).await;
        assert_eq!(ctx.role_info().await.role, Role::Admin);
    }

    #[tokio::test]
    async fn test_version_update_invalidates_queries() {
        let h = Harness::new("u1");
        h.store.set(VERSION_MARKER_KEY, serde_json::json!("0.0.1")).unwrap();
        let ctx = h.start();
        ctx.tasks().await.unwrap();

        let check = ctx.check_version();
        assert!(check.should_update);
        assert_eq!(ctx.queries().is_stale(&QueryKey::new([TASKS_KEY, "u1"])), Some(true));
        assert!(!ctx.check_version().should_update);
    }

    #[tokio::test]
    async fn test_shutdown_clears_everything() {
        let h = Harness::new("u1");
        let ctx = h.start();
        ctx.tasks().await.unwrap();
        assert_eq!(h.hub.subscriber_count(crate::cache::INVALIDATION_CHANNEL), 1);

        ctx.shutdown();
        assert!(ctx.queries().is_empty());
        eventually(|| h.hub.subscriber_count(crate::cache::INVALIDATION_CHANNEL) == 0).await;
    }
}
