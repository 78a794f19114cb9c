//! Keyed store of fetched results with staleness and eviction windows.
//!
//! Values of any type live side by side; each entry is keyed by a composite
//! [`QueryKey`] and remembers the [`QueryOptions`] it was last fetched with.
//! Concurrent fetches of one key share a single loader run, and a loader that
//! outlives its callers still writes its result back.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::dedup::RequestDeduplicator;
use crate::api::ApiError;
use crate::utils::lock;

type ErasedValue = Arc<dyn Any + Send + Sync>;

/// Buffer for invalidation notifications to active observers.
const NOTIFY_BUFFER_SIZE: usize = 256;

/// Separator used to flatten a key into a registry id; cannot appear in segments
/// coming from the UI layer.
const KEY_SEPARATOR: char = '\u{1f}';

// ============================================================================
// Keys
// ============================================================================

/// Composite query identity: an ordered list of key segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Segment-wise prefix match: `["tasks"]` matches `["tasks", "u1"]` but not
    /// `["tasks-archive"]`. The empty prefix matches everything.
    pub fn starts_with<S: AsRef<str>>(&self, prefix: &[S]) -> bool {
        prefix.len() <= self.0.len()
            && prefix
                .iter()
                .zip(&self.0)
                .all(|(p, s)| p.as_ref() == s.as_str())
    }

    fn id(&self) -> String {
        self.0.join(&KEY_SEPARATOR.to_string())
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

// ============================================================================
// Options
// ============================================================================

/// How many times a failed load is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// One retry, never for authentication-class errors.
    #[default]
    Default,
    Never,
    /// Up to n retries, never for authentication-class errors.
    Times(u32),
}

impl RetryPolicy {
    /// `failures` is the number of attempts that have failed so far.
    pub fn should_retry(&self, failures: u32, err: &ApiError) -> bool {
        if err.is_auth_error() {
            return false;
        }
        match self {
            RetryPolicy::Default => failures < 2,
            RetryPolicy::Never => false,
            RetryPolicy::Times(n) => failures <= *n,
        }
    }
}

/// Per-query caching behaviour.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOptions {
    /// Age after which cached data may be refetched.
    pub stale_time: Duration,
    /// Time without observers or access after which the entry is dropped.
    pub gc_time: Duration,
    pub refetch_on_window_focus: bool,
    pub refetch_on_reconnect: bool,
    /// Whether a fetch of stale (but not invalidated) data reloads it.
    pub refetch_on_mount: bool,
    pub retry: RetryPolicy,
    pub retry_delay: Duration,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            stale_time: Duration::from_secs(60),
            gc_time: Duration::from_secs(5 * 60),
            refetch_on_window_focus: false,
            refetch_on_reconnect: true,
            refetch_on_mount: true,
            retry: RetryPolicy::Default,
            retry_delay: Duration::from_secs(1),
        }
    }
}

impl QueryOptions {
    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    pub fn with_gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = gc_time;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_refetch_on_window_focus(mut self, enabled: bool) -> Self {
        self.refetch_on_window_focus = enabled;
        self
    }

    pub fn with_refetch_on_reconnect(mut self, enabled: bool) -> Self {
        self.refetch_on_reconnect = enabled;
        self
    }

    pub fn with_refetch_on_mount(mut self, enabled: bool) -> Self {
        self.refetch_on_mount = enabled;
        self
    }
}

/// External events that may cause observed stale queries to refetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefetchTrigger {
    WindowFocus,
    Reconnect,
}

// ============================================================================
// Entries
// ============================================================================

struct CacheEntry {
    key: QueryKey,
    value: Option<ErasedValue>,
    updated_at: Option<Instant>,
    invalidated: bool,
    /// Bumped by every invalidation; a load that started under an older
    /// generation stores its value but leaves the entry invalidated.
    generation: u64,
    /// Generation the current value was loaded under.
    value_generation: u64,
    options: QueryOptions,
    observers: usize,
    last_used: Instant,
}

impl CacheEntry {
    fn new(key: QueryKey, options: QueryOptions) -> Self {
        Self {
            key,
            value: None,
            updated_at: None,
            invalidated: false,
            generation: 0,
            value_generation: 0,
            options,
            observers: 0,
            last_used: Instant::now(),
        }
    }

    fn is_stale(&self) -> bool {
        self.invalidated
            || self
                .updated_at
                .map_or(true, |at| at.elapsed() >= self.options.stale_time)
    }

    /// Cached value that may be served without a load.
    fn servable(&self) -> Option<&ErasedValue> {
        let value = self.value.as_ref()?;
        if self.invalidated {
            return None;
        }
        if !self.is_stale() || !self.options.refetch_on_mount {
            return Some(value);
        }
        None
    }

    fn invalidate(&mut self) {
        self.invalidated = true;
        self.generation += 1;
    }

    fn is_collectable(&self, now: Instant) -> bool {
        self.observers == 0 && now.duration_since(self.last_used) >= self.options.gc_time
    }
}

#[derive(Debug, Clone, Copy)]
struct LoadStamp {
    epoch: u64,
    generation: u64,
}

struct Inner {
    entries: Mutex<HashMap<String, CacheEntry>>,
    /// Bumped by `clear`; loads started before a clear are discarded.
    epoch: AtomicU64,
    loads: RequestDeduplicator<ErasedValue>,
    notify: broadcast::Sender<QueryKey>,
}

impl Inner {
    fn store(&self, key: &QueryKey, value: ErasedValue, load: LoadStamp, options: &QueryOptions) {
        let mut entries = lock(&self.entries);
        if self.epoch.load(Ordering::SeqCst) != load.epoch {
            debug!(key = %key, "Cache cleared while loading, discarding result");
            return;
        }
        let entry = entries
            .entry(key.id())
            .or_insert_with(|| CacheEntry::new(key.clone(), options.clone()));
        if entry.value.is_some() && load.generation < entry.value_generation {
            debug!(key = %key, "Newer value already cached, discarding result");
            return;
        }
        entry.value = Some(value);
        entry.value_generation = load.generation;
        entry.updated_at = Some(Instant::now());
        entry.last_used = Instant::now();
        if entry.generation == load.generation {
            entry.invalidated = false;
        } else {
            debug!(key = %key, "Invalidated while loading, keeping entry stale");
        }
    }
}

// ============================================================================
// Cache
// ============================================================================

/// Shared query cache. Clone is cheap; clones see the same entries.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<Inner>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("entries", &self.len())
            .field("in_flight", &self.inner.loads.in_flight_count())
            .finish()
    }
}

impl QueryCache {
    pub fn new() -> Self {
        let (notify, _) = broadcast::channel(NOTIFY_BUFFER_SIZE);
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                epoch: AtomicU64::new(0),
                loads: RequestDeduplicator::new(),
                notify,
            }),
        }
    }

    /// Return cached data for `key` if it is still servable, otherwise run
    /// `loader` (deduplicated across concurrent callers, retried per
    /// `options.retry`) and cache its result.
    ///
    /// On failure the previous value, if any, stays cached.
    pub async fn fetch<T, F, Fut>(
        &self,
        key: &QueryKey,
        loader: F,
        options: &QueryOptions,
    ) -> Result<T, ApiError>
    where
        T: Clone + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        let id = key.id();
        let stamp = {
            let mut entries = lock(&self.inner.entries);
            let entry = entries
                .entry(id.clone())
                .or_insert_with(|| CacheEntry::new(key.clone(), options.clone()));
            entry.options = options.clone();
            entry.last_used = Instant::now();

            if let Some(value) = entry.servable() {
                match value.downcast_ref::<T>() {
                    Some(cached) => {
                        debug!(key = %key, "Query cache hit");
                        return Ok(cached.clone());
                    }
                    None => warn!(key = %key, "Cached value has a different type, reloading"),
                }
            }
            LoadStamp {
                epoch: self.inner.epoch.load(Ordering::SeqCst),
                generation: entry.generation,
            }
        };

        debug!(key = %key, "Query cache miss, loading");
        // Loads started before an invalidation or clear are not joined.
        let load_id = format!("{}#{}:{}", id, stamp.epoch, stamp.generation);
        let inner = Arc::clone(&self.inner);
        let owned_key = key.clone();
        let owned_options = options.clone();
        let erased = self
            .inner
            .loads
            .run(&load_id, move || async move {
                let value = load_with_retry(&owned_key, &loader, &owned_options).await?;
                let erased: ErasedValue = Arc::new(value);
                inner.store(&owned_key, Arc::clone(&erased), stamp, &owned_options);
                Ok(erased)
            })
            .await?;

        erased.downcast_ref::<T>().cloned().ok_or_else(|| {
            ApiError::InvalidResponse(format!("query {key} resolved to an unexpected type"))
        })
    }

    /// Cached value for `key` regardless of staleness.
    pub fn get_cached<T>(&self, key: &QueryKey) -> Option<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let entries = lock(&self.inner.entries);
        entries
            .get(&key.id())
            .and_then(|e| e.value.as_ref())
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    /// Replace cached data directly, e.g. after a local mutation.
    pub fn set_data<T>(&self, key: &QueryKey, value: T)
    where
        T: Send + Sync + 'static,
    {
        let mut entries = lock(&self.inner.entries);
        let entry = entries
            .entry(key.id())
            .or_insert_with(|| CacheEntry::new(key.clone(), QueryOptions::default()));
        entry.value = Some(Arc::new(value));
        entry.value_generation = entry.generation;
        entry.updated_at = Some(Instant::now());
        entry.last_used = Instant::now();
        entry.invalidated = false;
    }

    /// `None` when the key has never been cached.
    pub fn is_stale(&self, key: &QueryKey) -> Option<bool> {
        lock(&self.inner.entries).get(&key.id()).map(CacheEntry::is_stale)
    }

    /// Mark every entry under `prefix` stale. Observers are notified; the data
    /// itself stays cached until reloaded. Returns how many entries matched.
    pub fn invalidate<S: AsRef<str>>(&self, prefix: &[S]) -> usize {
        let keys: Vec<QueryKey> = {
            let mut entries = lock(&self.inner.entries);
            entries
                .values_mut()
                .filter(|e| e.key.starts_with(prefix))
                .map(|e| {
                    e.invalidate();
                    e.key.clone()
                })
                .collect()
        };
        for key in &keys {
            let _ = self.inner.notify.send(key.clone());
        }
        debug!(count = keys.len(), "Invalidated queries");
        keys.len()
    }

    pub fn invalidate_all(&self) -> usize {
        self.invalidate::<&str>(&[])
    }

    /// Drop every entry and forget in-flight loads.
    pub fn clear(&self) {
        let mut entries = lock(&self.inner.entries);
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        entries.clear();
        drop(entries);
        self.inner.loads.clear();
    }

    /// Register an active observer for `key`. Observed entries are never
    /// collected; dropping the guard releases the observation.
    pub fn observe(&self, key: &QueryKey) -> QueryObserver {
        {
            let mut entries = lock(&self.inner.entries);
            let entry = entries
                .entry(key.id())
                .or_insert_with(|| CacheEntry::new(key.clone(), QueryOptions::default()));
            entry.observers += 1;
            entry.last_used = Instant::now();
        }
        QueryObserver {
            cache: self.clone(),
            key: key.clone(),
        }
    }

    /// Invalidation notifications, one per affected key.
    pub fn subscribe_invalidations(&self) -> broadcast::Receiver<QueryKey> {
        self.inner.notify.subscribe()
    }

    pub fn on_window_focus(&self) -> Vec<QueryKey> {
        self.trigger(RefetchTrigger::WindowFocus)
    }

    pub fn on_reconnect(&self) -> Vec<QueryKey> {
        self.trigger(RefetchTrigger::Reconnect)
    }

    /// Invalidate observed, stale entries that opted into `trigger`.
    pub fn trigger(&self, trigger: RefetchTrigger) -> Vec<QueryKey> {
        let keys: Vec<QueryKey> = {
            let mut entries = lock(&self.inner.entries);
            entries
                .values_mut()
                .filter(|e| {
                    let enabled = match trigger {
                        RefetchTrigger::WindowFocus => e.options.refetch_on_window_focus,
                        RefetchTrigger::Reconnect => e.options.refetch_on_reconnect,
                    };
                    enabled && e.observers > 0 && e.value.is_some() && e.is_stale()
                })
                .map(|e| {
                    e.invalidate();
                    e.key.clone()
                })
                .collect()
        };
        for key in &keys {
            let _ = self.inner.notify.send(key.clone());
        }
        debug!(?trigger, count = keys.len(), "Refetch trigger fired");
        keys
    }

    /// Drop entries with no observers whose eviction window has elapsed.
    pub fn collect_garbage(&self) -> usize {
        let now = Instant::now();
        let mut entries = lock(&self.inner.entries);
        let before = entries.len();
        entries.retain(|_, e| !e.is_collectable(now));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, "Evicted unused queries");
        }
        removed
    }

    /// Run [`collect_garbage`](Self::collect_garbage) every `interval` until the
    /// handle is aborted.
    pub fn spawn_gc(&self, interval: Duration) -> JoinHandle<()> {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                cache.collect_garbage();
            }
        })
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        lock(&self.inner.entries).contains_key(&key.id())
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, key: &QueryKey) {
        let mut entries = lock(&self.inner.entries);
        if let Some(entry) = entries.get_mut(&key.id()) {
            entry.observers = entry.observers.saturating_sub(1);
            entry.last_used = Instant::now();
        }
    }
}

/// Guard for an active observation of one query.
pub struct QueryObserver {
    cache: QueryCache,
    key: QueryKey,
}

impl Drop for QueryObserver {
    fn drop(&mut self) {
        self.cache.release(&self.key);
    }
}

async fn load_with_retry<T, F, Fut>(
    key: &QueryKey,
    loader: &F,
    options: &QueryOptions,
) -> Result<T, ApiError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let mut failures = 0;
    loop {
        match loader().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                failures += 1;
                if !options.retry.should_retry(failures, &err) {
                    return Err(err);
                }
                warn!(key = %key, error = %err, attempt = failures, "Query failed, retrying");
                tokio::time::sleep(options.retry_delay).await;
            }
        }
    }
}
