//! Backend SPI - Durable Document Store
//!
//! The database tier talks to persistent storage only through [`Backend`].
//! A backend is an opaque store of flat JSON documents addressed by
//! `(collection, id)` that supports key lookup, iteration and one atomic
//! primitive: replace a document iff both its id and its version match.
//!
//! # Implementations
//!
//! - [`InMemoryBackend`] - `DashMap`-backed reference store
//! - [`FaultInjectingBackend`] - wrapper that forces lost races, transient
//!   errors and outages

pub mod faults;
pub mod memory;
pub mod monitor;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;

use crate::entity::Document;
use crate::error::{Error, Result};

pub use faults::FaultInjectingBackend;
pub use memory::InMemoryBackend;
pub use monitor::{BackendHealth, ConnectionMonitor, DEFAULT_AVERAGE_LATENCY};

/// Stream of stored documents
pub type DocumentStream = BoxStream<'static, Result<Document>>;

/// Stream of stored ids
pub type KeyStream = BoxStream<'static, Result<String>>;

/// Durable store used by the database tier
#[async_trait]
pub trait Backend: Send + Sync {
    /// Backend name used in logs and health reports
    fn name(&self) -> &str;

    /// Fetch one document
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>>;

    /// Insert a new document. Fails with `DuplicateKey` if `id` exists.
    async fn insert(&self, collection: &str, id: &str, document: Document) -> Result<()>;

    /// Whether a document with `id` exists
    async fn has(&self, collection: &str, id: &str) -> Result<bool>;

    /// Remove a document, returning whether it existed
    async fn remove(&self, collection: &str, id: &str) -> Result<bool>;

    /// Iterate every document of a collection
    async fn documents(&self, collection: &str) -> Result<DocumentStream>;

    /// Iterate every id of a collection without loading documents
    async fn keys(&self, collection: &str) -> Result<KeyStream>;

    /// Number of documents in a collection
    async fn size(&self, collection: &str) -> Result<u64>;

    /// Atomically replace the document matching `id` and `expected_version`.
    ///
    /// Returns `Ok(false)` when nothing matched (lost race or removed). At most
    /// one caller can succeed per distinct `expected_version`.
    async fn replace_if_version(
        &self,
        collection: &str,
        id: &str,
        expected_version: i64,
        document: Document,
    ) -> Result<bool>;

    /// Whether the backend is ready to serve cache traffic
    fn can_cache(&self) -> bool;

    /// Whether [`Backend::register_index`] and [`Backend::id_by_index`] are served natively
    fn supports_native_indexes(&self) -> bool {
        false
    }

    /// Create (or confirm) a unique index over `field`
    async fn register_index(&self, collection: &str, field: &str) -> Result<()> {
        let _ = field;
        Err(Error::Backend(format!(
            "{} has no native index support (collection {collection})",
            self.name()
        )))
    }

    /// Projection-only lookup of the id whose `field` equals `value`
    async fn id_by_index(&self, collection: &str, field: &str, value: &Value) -> Result<Option<String>> {
        let _ = (field, value);
        Err(Error::Backend(format!(
            "{} has no native index support (collection {collection})",
            self.name()
        )))
    }

    /// Latency and connectivity snapshot
    fn health(&self) -> BackendHealth;

    /// Operation counters
    fn stats(&self) -> BackendStats;
}

/// Backend operation counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendStats {
    /// Documents across all collections
    pub document_count: u64,
    /// Read operations
    pub reads: u64,
    /// Insert operations
    pub writes: u64,
    /// Remove operations
    pub deletes: u64,
    /// Conditional replace calls
    pub cas_attempts: u64,
    /// Conditional replaces that matched nothing
    pub cas_conflicts: u64,
}
