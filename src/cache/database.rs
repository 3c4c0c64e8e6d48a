//! Database Tier
//!
//! Binds one cache's collection on a shared [`Backend`] and speaks in
//! records instead of documents. When the backend has no native index
//! support, the tier keeps the [`IndexMapping`] itself and enforces its
//! uniqueness: inserts and conditional replaces check the mapping and
//! rewrite it under one lock.

use std::sync::Arc;

use futures::stream::{BoxStream, StreamExt, TryStreamExt};
use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use super::index::{Index, IndexExtractor, IndexMapping, IndexValue};
use crate::backend::{Backend, BackendHealth};
use crate::entity::{codec, Entity, EntityKey, Record};
use crate::error::{Error, Result};

/// Durable tier of one cache
pub struct DatabaseTier<E: Entity> {
    collection: String,
    backend: Arc<dyn Backend>,
    /// Registered indexes, used to maintain `mapping`
    indexes: RwLock<Vec<(&'static str, IndexExtractor<E>)>>,
    mapping: IndexMapping,
    /// Held from the mapping check until the mapping reflects the write
    index_writes: Mutex<()>,
}

impl<E: Entity> DatabaseTier<E> {
    /// Bind `collection` on `backend`
    pub fn new(collection: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        Self {
            collection: collection.into(),
            backend,
            indexes: RwLock::new(Vec::new()),
            mapping: IndexMapping::new(),
            index_writes: Mutex::new(()),
        }
    }

    /// Collection name
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Underlying backend
    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Fetch and decode one record
    pub async fn get(&self, key: &E::Key) -> Result<Option<Record<E>>> {
        match self.backend.get(&self.collection, &key.to_key_string()).await? {
            Some(document) => Ok(Some(codec::decode(&document)?)),
            None => Ok(None),
        }
    }

    /// Persist a new record. Fails with `DuplicateKey` if the id exists and
    /// with `UniqueViolation` if an indexed value is taken.
    pub async fn insert(&self, record: &Record<E>) -> Result<()> {
        let document = codec::encode(record)?;
        let _mapped = self.lock_mapped_indexes().await;
        self.check_unique(record)?;
        self.backend
            .insert(&self.collection, &record.key().to_key_string(), document)
            .await?;
        self.cache_indexes(record);
        Ok(())
    }

    /// Whether a record exists
    pub async fn has(&self, key: &E::Key) -> Result<bool> {
        self.backend.has(&self.collection, &key.to_key_string()).await
    }

    /// Remove a record, returning whether it existed
    pub async fn remove(&self, key: &E::Key) -> Result<bool> {
        self.backend.remove(&self.collection, &key.to_key_string()).await
    }

    /// Stream every record
    pub async fn records(&self) -> Result<BoxStream<'static, Result<Record<E>>>> {
        let documents = self.backend.documents(&self.collection).await?;
        Ok(documents
            .and_then(|document| async move { codec::decode::<E>(&document) })
            .boxed())
    }

    /// Stream every key
    pub async fn keys(&self) -> Result<BoxStream<'static, Result<E::Key>>> {
        let keys = self.backend.keys(&self.collection).await?;
        Ok(keys
            .and_then(|id| async move { E::Key::from_key_string(&id) })
            .boxed())
    }

    /// Number of persisted records
    pub async fn size(&self) -> Result<u64> {
        self.backend.size(&self.collection).await
    }

    /// Compare-and-swap: replace the record iff its stored version is
    /// `expected_version`
    pub async fn replace_if_version(&self, record: &Record<E>, expected_version: i64) -> Result<bool> {
        let document = codec::encode(record)?;
        let _mapped = self.lock_mapped_indexes().await;
        self.check_unique(record)?;
        let replaced = self
            .backend
            .replace_if_version(
                &self.collection,
                &record.key().to_key_string(),
                expected_version,
                document,
            )
            .await?;
        if replaced {
            self.cache_indexes(record);
        }
        Ok(replaced)
    }

    /// Backend readiness
    pub fn can_cache(&self) -> bool {
        self.backend.can_cache()
    }

    /// Backend latency and connectivity
    pub fn health(&self) -> BackendHealth {
        self.backend.health()
    }

    // =========================================================================
    // Indexes
    // =========================================================================

    /// Register an index natively, or start maintaining it locally
    pub async fn register_index<T: IndexValue>(&self, index: &Index<E, T>) -> Result<()> {
        if self.backend.supports_native_indexes() {
            return self
                .backend
                .register_index(&self.collection, index.name())
                .await;
        }

        let _writes = self.index_writes.lock().await;
        let extract = index.string_extractor();
        {
            let mut indexes = self.indexes.write();
            if indexes.iter().any(|(name, _)| *name == index.name()) {
                return Ok(());
            }
            indexes.push((index.name(), Arc::clone(&extract)));
        }

        // Backfill from what is already persisted
        let backfilled = match self.backfill(index.name(), &extract).await {
            Ok(backfilled) => backfilled,
            Err(e) => {
                self.indexes.write().retain(|(name, _)| *name != index.name());
                self.mapping.drop_index(index.name());
                return Err(e);
            }
        };
        info!(
            collection = %self.collection,
            index = index.name(),
            backfilled,
            "Maintaining index outside the backend"
        );
        Ok(())
    }

    async fn backfill(&self, name: &'static str, extract: &IndexExtractor<E>) -> Result<usize> {
        let mut records = self.records().await?;
        let mut backfilled = 0usize;
        while let Some(record) = records.try_next().await? {
            let id = record.key().to_key_string();
            if let Some(value) = extract(record.entity()) {
                if let Some((index, value, owner)) = self.mapping.conflict(&id, &[(name, value)]) {
                    return Err(self.unique_violation(index, value, owner));
                }
            }
            self.cache_indexes(&record);
            backfilled += 1;
        }
        Ok(backfilled)
    }

    /// Lock held across check-and-write while indexes are kept locally
    async fn lock_mapped_indexes(&self) -> Option<MutexGuard<'_, ()>> {
        let mapped = !self.indexes.read().is_empty();
        if mapped {
            Some(self.index_writes.lock().await)
        } else {
            None
        }
    }

    /// Fail if one of `record`'s indexed values belongs to another id
    fn check_unique(&self, record: &Record<E>) -> Result<()> {
        let entries = self.index_entries(record);
        if entries.is_empty() {
            return Ok(());
        }
        match self.mapping.conflict(&record.key().to_key_string(), &entries) {
            Some((index, value, owner)) => Err(self.unique_violation(index, value, owner)),
            None => Ok(()),
        }
    }

    fn unique_violation(&self, index: &str, value: String, owner: String) -> Error {
        Error::UniqueViolation {
            cache: self.collection.clone(),
            index: index.to_string(),
            value,
            owner,
        }
    }

    fn index_entries(&self, record: &Record<E>) -> Vec<(&'static str, String)> {
        self.indexes
            .read()
            .iter()
            .filter_map(|(name, extract)| extract(record.entity()).map(|value| (*name, value)))
            .collect()
    }

    /// Id of the record whose indexed value equals `value`
    pub async fn id_by_index<T: IndexValue>(&self, index: &Index<E, T>, value: &T) -> Result<Option<E::Key>> {
        let id = if self.backend.supports_native_indexes() {
            let value: Value = serde_json::to_value(value)?;
            self.backend
                .id_by_index(&self.collection, index.name(), &value)
                .await?
        } else {
            self.mapping.lookup(index.name(), &value.to_index_string())
        };
        id.map(|id| E::Key::from_key_string(&id)).transpose()
    }

    /// Rewrite the local mapping for `record`. No-op for native indexes.
    pub fn cache_indexes(&self, record: &Record<E>) {
        if self.indexes.read().is_empty() {
            return;
        }
        let entries = self.index_entries(record);
        self.mapping.rewrite(&record.key().to_key_string(), entries);
    }

    /// Drop every local mapping entry of `key`
    pub fn invalidate_indexes(&self, key: &E::Key) {
        if !self.indexes.read().is_empty() {
            self.mapping.invalidate(&key.to_key_string());
            debug!(collection = %self.collection, key = ?key, "Invalidated index entries");
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::error::Error;
    use crate::test_support::{user_record, User};
    use assert_matches::assert_matches;

    fn frozen(key: &str, name: &str, age: u32) -> Record<User> {
        let mut record = user_record(key, name, age);
        record.set_read_only(true);
        record
    }

    fn tier(backend: InMemoryBackend) -> DatabaseTier<User> {
        DatabaseTier::new("users", Arc::new(backend))
    }

    #[tokio::test]
    async fn test_insert_get_round_trip() {
        let db = tier(InMemoryBackend::new());
        db.insert(&frozen("u1", "Alice", 25)).await.unwrap();

        let record = db.get(&"u1".to_string()).await.unwrap().unwrap();
        assert!(record.is_read_only());
        assert_eq!(record.version(), 0);
        assert_eq!(record.entity().name.get().unwrap(), Some(&"Alice".to_string()));
        assert!(db.get(&"u2".to_string()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_insert() {
        let db = tier(InMemoryBackend::new());
        db.insert(&frozen("u1", "Alice", 25)).await.unwrap();
        assert_matches!(
            db.insert(&frozen("u1", "Eve", 30)).await,
            Err(Error::DuplicateKey { .. })
        );
    }

    #[tokio::test]
    async fn test_records_and_keys() {
        let db = tier(InMemoryBackend::new());
        db.insert(&frozen("u1", "Alice", 25)).await.unwrap();
        db.insert(&frozen("u2", "Bob", 30)).await.unwrap();

        let records: Vec<Record<User>> = db.records().await.unwrap().try_collect().await.unwrap();
        assert_eq!(records.len(), 2);

        let mut keys: Vec<String> = db.keys().await.unwrap().try_collect().await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["u1", "u2"]);
        assert_eq!(db.size().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_replace_if_version() {
        let db = tier(InMemoryBackend::new());
        let record = frozen("u1", "Alice", 25);
        db.insert(&record).await.unwrap();

        let mut next = record.clone();
        next.set_read_only(false);
        next.entity_mut().age.set(26).unwrap();
        next.set_version(1).unwrap();

        assert!(db.replace_if_version(&next, 0).await.unwrap());
        assert!(!db.replace_if_version(&next, 0).await.unwrap());
        assert_eq!(db.get(&"u1".to_string()).await.unwrap().unwrap().version(), 1);
    }

    #[tokio::test]
    async fn test_local_mapping_when_not_native() {
        let db = tier(InMemoryBackend::without_native_indexes());
        db.insert(&frozen("u1", "Alice", 25)).await.unwrap();

        let by_name: Index<User, String> = Index::field(|user: &User| &user.name);
        db.register_index(&by_name).await.unwrap();

        // Backfilled on registration
        assert_eq!(
            db.id_by_index(&by_name, &"Alice".to_string()).await.unwrap(),
            Some("u1".to_string())
        );

        let bob = frozen("u2", "Bob", 30);
        db.insert(&bob).await.unwrap();
        db.cache_indexes(&bob);
        assert_eq!(
            db.id_by_index(&by_name, &"Bob".to_string()).await.unwrap(),
            Some("u2".to_string())
        );

        db.invalidate_indexes(&"u2".to_string());
        assert_eq!(db.id_by_index(&by_name, &"Bob".to_string()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_local_mapping_enforces_uniqueness() {
        let db = tier(InMemoryBackend::without_native_indexes());
        let by_name: Index<User, String> = Index::field(|user: &User| &user.name);
        db.register_index(&by_name).await.unwrap();

        db.insert(&frozen("u1", "Alice", 25)).await.unwrap();
        assert_matches!(
            db.insert(&frozen("u2", "Alice", 30)).await,
            Err(Error::UniqueViolation { owner, .. }) if owner == "u1"
        );
        assert!(!db.has(&"u2".to_string()).await.unwrap());

        db.insert(&frozen("u2", "Bob", 30)).await.unwrap();
        let mut renamed = frozen("u2", "Alice", 30);
        renamed.set_read_only(false);
        renamed.set_version(1).unwrap();
        assert_matches!(
            db.replace_if_version(&renamed, 0).await,
            Err(Error::UniqueViolation { .. })
        );
        assert_eq!(
            db.id_by_index(&by_name, &"Alice".to_string()).await.unwrap(),
            Some("u1".to_string())
        );

        // A committed rename moves the mapping with it
        renamed.entity_mut().name.set("Bobby".into()).unwrap();
        assert!(db.replace_if_version(&renamed, 0).await.unwrap());
        assert_eq!(db.id_by_index(&by_name, &"Bob".to_string()).await.unwrap(), None);
        assert_eq!(
            db.id_by_index(&by_name, &"Bobby".to_string()).await.unwrap(),
            Some("u2".to_string())
        );
    }

    #[tokio::test]
    async fn test_local_mapping_refused_over_duplicates() {
        let db = tier(InMemoryBackend::without_native_indexes());
        db.insert(&frozen("u1", "Alice", 25)).await.unwrap();
        db.insert(&frozen("u2", "Alice", 30)).await.unwrap();

        let by_name: Index<User, String> = Index::field(|user: &User| &user.name);
        assert_matches!(
            db.register_index(&by_name).await,
            Err(Error::UniqueViolation { .. })
        );
        assert_eq!(db.id_by_index(&by_name, &"Alice".to_string()).await.unwrap(), None);

        // The index was not kept, so writes are unconstrained
        db.insert(&frozen("u3", "Alice", 35)).await.unwrap();
    }

    #[tokio::test]
    async fn test_native_index_delegates() {
        let db = tier(InMemoryBackend::new());
        db.insert(&frozen("u1", "Alice", 25)).await.unwrap();

        let by_name: Index<User, String> = Index::field(|user: &User| &user.name);
        db.register_index(&by_name).await.unwrap();
        assert_eq!(
            db.id_by_index(&by_name, &"Alice".to_string()).await.unwrap(),
            Some("u1".to_string())
        );
        assert_eq!(db.id_by_index(&by_name, &"Carol".to_string()).await.unwrap(), None);
    }
}
