//! # Offcache Engine
//!
//! Offline caching for web applications: decides per request whether to
//! answer from cache or network, keeps the caches bounded, installs and
//! activates versioned app shells, and replays actions queued while offline.
//!
//! ## Architecture
//!
//! ```text
//! OfflineEngine
//!     ├── Classifier ── Category ──> Strategy
//!     ├── StrategyExecutor
//!     │       ├── cache-first            (static partition)
//!     │       ├── network-first          (api partition)
//!     │       ├── stale-while-revalidate (dynamic partition)
//!     │       └── navigation fallback    (static partition)
//!     ├── EvictionManager ── sweep / spawn_periodic
//!     ├── LifecycleController ── install / activate
//!     └── SyncQueue ── enqueue / drain / reconnect listener
//!
//! EngineEvent ──> mpsc channel ──> host
//! ```
//!
//! The engine owns no I/O of its own: storage comes in as a
//! [`PartitionStore`](offcache_store::PartitionStore) and
//! [`QueueLog`](offcache_store::QueueLog), the network as a
//! [`Fetcher`](offcache_net::Fetcher).

pub mod classify;
pub mod config;
pub mod engine;
pub mod eviction;
pub mod events;
pub mod lifecycle;
pub mod mutation;
pub mod strategy;
pub mod sync_queue;

#[cfg(test)]
mod testing;

pub use classify::{Category, ClassifiedRequest, Classifier, Route};
pub use config::{
    ClassifierConfig, EngineConfig, EvictionConfig, LifecycleConfig, PartitionConfig,
    PartitionKind, SyncConfig,
};
pub use engine::{Interception, MutationOutcome, OfflineEngine};
pub use eviction::{EvictionManager, EvictionTarget};
pub use events::{EngineEvent, EventReceiver, EventSender};
pub use lifecycle::{LifecycleController, LifecyclePlan, LifecycleState};
pub use mutation::{FetchDelivery, MutationRecord};
pub use strategy::{NavigationFallback, Resolution, Strategy, StrategyExecutor};
pub use sync_queue::{DrainOutcome, DrainReport, SyncDelivery, SyncQueue};
