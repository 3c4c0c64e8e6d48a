//! Two-Tiered Entity Cache
//!
//! Process-local handles in front of a durable document backend.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                            Cache<E>                           │
//! ├───────────────────────────────────────────────────────────────┤
//! │  Local Tier                  │  Database Tier                 │
//! │  ┌────────────────────────┐  │  ┌──────────────────────────┐  │
//! │  │ DashMap<Key, Handle>   │  │  │ dyn Backend (collection) │  │
//! │  │ LRU + TTL eviction     │  │  │ + IndexMapping fallback  │  │
//! │  └────────────────────────┘  │  └──────────────────────────┘  │
//! │             │                │               │                │
//! │             └────────────────┴───────────────┘                │
//! │                              │                                │
//! │                Update Engine (CAS + linear backoff)           │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Design Principles
//!
//! - One handle per key in the local tier; updates merge in place
//! - Mutations never touch a handle until the backend accepted them
//! - Versions only grow, one step per committed update

mod blocking;
mod database;
mod index;
mod local;
mod manager;
mod metrics;
mod update;

pub use blocking::BlockingCache;
pub use database::DatabaseTier;
pub use index::{Index, IndexMapping, IndexValue};
pub use local::{LocalTier, LocalTierConfig, LocalTierStats};
pub use manager::{Cache, CacheConfig};
pub use metrics::{CacheMetrics, LatencyTracker, MetricsSnapshot};
pub use update::{RetryPolicy, UpdateEngine, UpdateOutcome, DEFAULT_MAX_ATTEMPTS};
