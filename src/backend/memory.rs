//! In-Memory Backend
//!
//! Reference [`Backend`] for tests, demos and single-process deployments.
//!
//! # Design
//!
//! - `DashMap` per collection for lock-free concurrent access
//! - Conditional replace runs under the shard write lock of the document, so
//!   the version check and the swap are one atomic step
//! - Registered indexes are unique: writes to an indexed collection are
//!   serialized so a value is checked and claimed in one step
//! - Optional simulated round-trip latency feeding the [`ConnectionMonitor`]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::Ref;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info};

use super::monitor::{BackendHealth, ConnectionMonitor};
use super::{Backend, BackendStats, DocumentStream, KeyStream};
use crate::entity::codec::document_version;
use crate::entity::Document;
use crate::error::{Error, Result};

type Collection = DashMap<String, Document>;

/// In-memory backend configuration
#[derive(Debug, Clone)]
pub struct InMemoryConfig {
    /// Name reported in logs and health
    pub name: String,
    /// Serve unique indexes natively
    pub native_indexes: bool,
    /// Simulated round-trip per operation
    pub latency: Option<Duration>,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            name: "memory".to_string(),
            native_indexes: true,
            latency: None,
        }
    }
}

/// In-memory document store
pub struct InMemoryBackend {
    /// collection -> id -> document
    collections: DashMap<String, Collection>,
    /// (collection, field) pairs with a registered index
    indexes: RwLock<HashSet<(String, String)>>,
    /// Held across the uniqueness check and the write it guards
    unique_writes: Mutex<()>,
    config: InMemoryConfig,
    monitor: ConnectionMonitor,
    // Statistics
    reads: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    cas_attempts: AtomicU64,
    cas_conflicts: AtomicU64,
}

impl InMemoryBackend {
    /// Create a connected backend with default configuration
    pub fn new() -> Self {
        Self::with_config(InMemoryConfig::default())
    }

    /// Create a connected backend with custom configuration
    pub fn with_config(config: InMemoryConfig) -> Self {
        Self {
            collections: DashMap::new(),
            indexes: RwLock::new(HashSet::new()),
            unique_writes: Mutex::new(()),
            config,
            monitor: ConnectionMonitor::connected(),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            cas_attempts: AtomicU64::new(0),
            cas_conflicts: AtomicU64::new(0),
        }
    }

    /// Backend without native index support
    pub fn without_native_indexes() -> Self {
        Self::with_config(InMemoryConfig {
            native_indexes: false,
            ..Default::default()
        })
    }

    /// Connection state tracker
    pub fn monitor(&self) -> &ConnectionMonitor {
        &self.monitor
    }

    /// Simulate a connection change
    pub fn set_connected(&self, connected: bool) {
        self.monitor.set_connected(connected);
    }

    fn collection(&self, name: &str) -> Ref<'_, String, Collection> {
        if let Some(collection) = self.collections.get(name) {
            return collection;
        }
        self.collections
            .entry(name.to_string())
            .or_default()
            .downgrade()
    }

    fn indexed_fields(&self, collection: &str) -> Vec<String> {
        self.indexes
            .read()
            .iter()
            .filter(|(c, _)| c == collection)
            .map(|(_, field)| field.clone())
            .collect()
    }

    /// Reject `document` if another id already holds one of its indexed
    /// values. Null and missing values are not indexed.
    fn check_unique(&self, collection: &str, id: &str, document: &Document) -> Result<()> {
        let fields = self.indexed_fields(collection);
        if fields.is_empty() {
            return Ok(());
        }
        let Some(documents) = self.collections.get(collection) else {
            return Ok(());
        };
        for field in fields {
            let Some(value) = document.get(&field).filter(|v| !v.is_null()) else {
                continue;
            };
            let owner = documents
                .iter()
                .filter(|doc| doc.key() != id && doc.value().get(&field) == Some(value))
                .map(|doc| doc.key().clone())
                .min();
            if let Some(owner) = owner {
                return Err(Error::UniqueViolation {
                    cache: collection.to_string(),
                    index: field,
                    value: value.to_string(),
                    owner,
                });
            }
        }
        Ok(())
    }

    async fn round_trip(&self) {
        if let Some(latency) = self.config.latency {
            tokio::time::sleep(latency).await;
            self.monitor.record_sample(&self.config.name, latency);
        }
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    fn name(&self) -> &str {
        &self.config.name
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        self.round_trip().await;
        self.reads.fetch_add(1, Ordering::Relaxed);

        Ok(self
            .collections
            .get(collection)
            .and_then(|c| c.get(id).map(|doc| doc.clone())))
    }

    async fn insert(&self, collection: &str, id: &str, document: Document) -> Result<()> {
        self.round_trip().await;
        self.writes.fetch_add(1, Ordering::Relaxed);

        let _unique = self.unique_writes.lock();
        self.check_unique(collection, id, &document)?;
        let documents = self.collection(collection);
        let inserted = match documents.entry(id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(document);
                true
            }
        };
        if !inserted {
            return Err(Error::DuplicateKey {
                cache: collection.to_string(),
                key: id.to_string(),
            });
        }
        Ok(())
    }

    async fn has(&self, collection: &str, id: &str) -> Result<bool> {
        self.round_trip().await;
        self.reads.fetch_add(1, Ordering::Relaxed);

        Ok(self
            .collections
            .get(collection)
            .map(|c| c.contains_key(id))
            .unwrap_or(false))
    }

    async fn remove(&self, collection: &str, id: &str) -> Result<bool> {
        self.round_trip().await;
        self.deletes.fetch_add(1, Ordering::Relaxed);

        Ok(self
            .collections
            .get(collection)
            .map(|c| c.remove(id).is_some())
            .unwrap_or(false))
    }

    async fn documents(&self, collection: &str) -> Result<DocumentStream> {
        self.round_trip().await;
        self.reads.fetch_add(1, Ordering::Relaxed);

        let snapshot: Vec<Document> = self
            .collections
            .get(collection)
            .map(|c| c.iter().map(|doc| doc.value().clone()).collect())
            .unwrap_or_default();
        Ok(stream::iter(snapshot.into_iter().map(Ok)).boxed())
    }

    async fn keys(&self, collection: &str) -> Result<KeyStream> {
        self.round_trip().await;
        self.reads.fetch_add(1, Ordering::Relaxed);

        let snapshot: Vec<String> = self
            .collections
            .get(collection)
            .map(|c| c.iter().map(|doc| doc.key().clone()).collect())
            .unwrap_or_default();
        Ok(stream::iter(snapshot.into_iter().map(Ok)).boxed())
    }

    async fn size(&self, collection: &str) -> Result<u64> {
        self.round_trip().await;
        Ok(self
            .collections
            .get(collection)
            .map(|c| c.len() as u64)
            .unwrap_or(0))
    }

    async fn replace_if_version(
        &self,
        collection: &str,
        id: &str,
        expected_version: i64,
        document: Document,
    ) -> Result<bool> {
        self.round_trip().await;
        self.cas_attempts.fetch_add(1, Ordering::Relaxed);

        let _unique = self.unique_writes.lock();
        self.check_unique(collection, id, &document)?;
        let Some(documents) = self.collections.get(collection) else {
            self.cas_conflicts.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        };
        // Holding the shard write lock makes check-and-swap atomic
        let Some(mut current) = documents.get_mut(id) else {
            self.cas_conflicts.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        };
        if document_version(&current) != expected_version {
            self.cas_conflicts.fetch_add(1, Ordering::Relaxed);
            debug!(
                collection,
                id,
                expected_version,
                found = document_version(&current),
                "Conditional replace matched nothing"
            );
            return Ok(false);
        }
        *current = document;
        Ok(true)
    }

    fn can_cache(&self) -> bool {
        self.monitor.is_connected()
    }

    fn supports_native_indexes(&self) -> bool {
        self.config.native_indexes
    }

    async fn register_index(&self, collection: &str, field: &str) -> Result<()> {
        if !self.config.native_indexes {
            return Err(Error::Backend(format!(
                "{} has no native index support (collection {collection})",
                self.config.name
            )));
        }
        let _unique = self.unique_writes.lock();
        let key = (collection.to_string(), field.to_string());
        if self.indexes.read().contains(&key) {
            return Ok(());
        }

        // Refuse to build a unique index over values that already collide
        if let Some(documents) = self.collections.get(collection) {
            let mut owners: HashMap<String, String> = HashMap::new();
            for doc in documents.iter() {
                let Some(value) = doc.value().get(field).filter(|v| !v.is_null()) else {
                    continue;
                };
                let (id, value) = (doc.key().clone(), value.to_string());
                if let Some(owner) = owners.insert(value.clone(), id.clone()) {
                    return Err(Error::UniqueViolation {
                        cache: collection.to_string(),
                        index: field.to_string(),
                        value,
                        owner: owner.min(id),
                    });
                }
            }
        }

        self.indexes.write().insert(key);
        info!(collection, field, "Registered unique index");
        Ok(())
    }

    async fn id_by_index(&self, collection: &str, field: &str, value: &Value) -> Result<Option<String>> {
        let registered = self
            .indexes
            .read()
            .contains(&(collection.to_string(), field.to_string()));
        if !registered {
            return Err(Error::Backend(format!(
                "no index on {collection}.{field}"
            )));
        }
        self.round_trip().await;
        self.reads.fetch_add(1, Ordering::Relaxed);

        // Projection: compare one field, return only the id
        Ok(self.collections.get(collection).and_then(|c| {
            c.iter()
                .filter(|doc| doc.value().get(field) == Some(value))
                .map(|doc| doc.key().clone())
                .min()
        }))
    }

    fn health(&self) -> BackendHealth {
        self.monitor.health()
    }

    fn stats(&self) -> BackendStats {
        BackendStats {
            document_count: self.collections.iter().map(|c| c.len() as u64).sum(),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            cas_attempts: self.cas_attempts.load(Ordering::Relaxed),
            cas_conflicts: self.cas_conflicts.load(Ordering::Relaxed),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
