//! Collapses concurrent identical requests into a single in-flight operation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, warn};

use crate::api::ApiError;
use crate::utils::lock;

type Pending<T> = Shared<BoxFuture<'static, Result<T, ApiError>>>;

struct InFlight<T> {
    id: u64,
    pending: Pending<T>,
}

struct Registry<T> {
    next_id: u64,
    in_flight: HashMap<String, InFlight<T>>,
}

/// Registry of in-flight operations keyed by request identity.
///
/// The first caller for a key spawns the operation; callers arriving before it
/// settles await the same shared outcome. The operation runs on its own task,
/// so it completes (and its side effects land) even if every caller goes away.
pub struct RequestDeduplicator<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T> Clone for RequestDeduplicator<T> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<T> Default for RequestDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RequestDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                in_flight: HashMap::new(),
            })),
        }
    }

    /// Run `operation` unless an identical one is already in flight, in which
    /// case wait for that one instead. `operation` is only invoked by the
    /// caller that registers the key.
    pub async fn run<F, Fut>(&self, key: &str, operation: F) -> Result<T, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        let pending = {
            let mut registry = lock(&self.registry);
            if let Some(existing) = registry.in_flight.get(key) {
                debug!(key, "Joining in-flight request");
                existing.pending.clone()
            } else {
                let id = registry.next_id;
                registry.next_id += 1;

                let handle = Arc::clone(&self.registry);
                let owned_key = key.to_string();
                let work = operation();
                let task = tokio::spawn(async move {
                    let outcome = work.await;
                    // Settled: the next caller for this key starts fresh.
                    let mut registry = lock(&handle);
                    if registry.in_flight.get(&owned_key).map(|f| f.id) == Some(id) {
                        registry.in_flight.remove(&owned_key);
                    }
                    outcome
                });

                let pending = async move {
                    match task.await {
                        Ok(outcome) => outcome,
                        Err(err) => {
                            warn!(error = %err, "In-flight request task did not complete");
                            Err(ApiError::Network(format!("request task aborted: {err}")))
                        }
                    }
                }
                .boxed()
                .shared();

                registry.in_flight.insert(
                    key.to_string(),
                    InFlight {
                        id,
                        pending: pending.clone(),
                    },
                );
                pending
            }
        };
        pending.await
    }

    /// Whether an operation for `key` has not settled yet.
    pub fn is_in_flight(&self, key: &str) -> bool {
        lock(&self.registry).in_flight.contains_key(key)
    }

    pub fn in_flight_count(&self) -> usize {
        lock(&self.registry).in_flight.len()
    }

    /// Forget every in-flight operation. Running operations still finish, but
    /// new callers no longer join them.
    pub fn clear(&self) {
        lock(&self.registry).in_flight.clear();
    }
}
