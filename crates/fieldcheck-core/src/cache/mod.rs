//! Client-side caching: the keyed query cache, request deduplication, and
//! cross-session invalidation.
//!
//! - `QueryCache`: per-key staleness and eviction windows, prefix invalidation,
//!   refetch triggers, retry policy
//! - `RequestDeduplicator`: one in-flight operation per key, shared outcome
//! - `InvalidationBroadcaster`: at-most-once invalidation messages over a
//!   publish/subscribe transport

pub mod dedup;
pub mod invalidation;
pub mod query;

pub use dedup::RequestDeduplicator;
pub use invalidation::{
    BroadcastMessage, BroadcastPublisher, BroadcastSubscriber, InvalidationBroadcaster,
    InvalidationKind, InvalidationMessage, LocalHub, INVALIDATION_CHANNEL, INVALIDATION_EVENT,
    TASK_PREFIXES,
};
pub use query::{QueryCache, QueryKey, QueryObserver, QueryOptions, RefetchTrigger, RetryPolicy};
