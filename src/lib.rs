//! tiercache - Tiered Entity Cache
//!
//! Read-through entity caching over a pluggable persistent backend, with
//! optimistic-concurrency updates and secondary indexes.
//!
//! # Architecture
//!
//! ```text
//! caller ──▶ Cache<E> ──▶ Local Tier (handles) ──miss──▶ Database Tier ──▶ dyn Backend
//!                │                                           ▲
//!                └──── Update Engine (working copy + CAS) ───┘
//! ```
//!
//! Entities handed out by a cache are read-only [`Handle`]s. Updates run a
//! mutation closure on a private working copy, commit it with a conditional
//! replace on `(id, version)` and merge the result back into the handle,
//! retrying with jittered linear backoff when another writer wins.
//!
//! # Modules
//!
//! - [`backend`] - Backend SPI, in-memory and fault-injecting backends
//! - [`cache`] - Local tier, database tier, update engine, indexes
//! - [`entity`] - Fields, records, handles and the document codec
//! - [`error`] - Error types
//! - [`health`] - Readiness reporting
//! - [`registry`] - Named caches and dependency-ordered lifecycle

pub mod backend;
pub mod cache;
pub mod entity;
pub mod error;
pub mod health;
pub mod registry;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use backend::{Backend, FaultInjectingBackend, InMemoryBackend};
pub use cache::{BlockingCache, Cache, CacheConfig, Index, LocalTierConfig, RetryPolicy, UpdateOutcome};
pub use entity::{Entity, EntityKey, Field, FieldAccess, Handle, Record};
pub use error::{Error, Result};
pub use health::{HealthReport, HealthStatus};
pub use registry::{ManagedCache, Registry};
