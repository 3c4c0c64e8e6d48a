//! Cache Manager - Local Tier over Database Tier
//!
//! [`Cache`] is the only entry point callers use. Reads consult the local
//! tier first and fall back to the database tier; mutations run against
//! private working copies and reach the backend through the update engine.
//! Every handle returned is read-only and reference-stable: a committed
//! update is merged into the cached handle instead of replacing it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::TryStreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use super::database::DatabaseTier;
use super::index::{Index, IndexValue};
use super::local::{LocalTier, LocalTierConfig, LocalTierStats};
use super::metrics::{CacheMetrics, LatencyTracker, MetricsSnapshot};
use super::update::{RetryPolicy, UpdateEngine, UpdateOutcome};
use crate::backend::{Backend, BackendHealth};
use crate::entity::{Entity, Handle, Record};
use crate::error::{Error, Result};

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Local tier configuration
    pub local: LocalTierConfig,
    /// Update retry policy
    pub retry: RetryPolicy,
    /// Keep entities loaded from the backend in the local tier
    pub cache_on_read: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            local: LocalTierConfig::default(),
            retry: RetryPolicy::default(),
            cache_on_read: true,
        }
    }
}

impl CacheConfig {
    /// Reject nonsensical values
    pub fn validate(&self) -> Result<()> {
        self.local.validate()?;
        self.retry.validate()
    }
}

/// Tiered cache of one entity type
pub struct Cache<E: Entity> {
    name: String,
    dependencies: Vec<String>,
    local: LocalTier<E>,
    database: DatabaseTier<E>,
    engine: UpdateEngine,
    config: CacheConfig,
    metrics: Arc<CacheMetrics>,
    running: AtomicBool,
}

impl<E: Entity> Cache<E> {
    /// Create a cache with default configuration; `name` is also the
    /// backend collection
    pub fn new(name: impl Into<String>, backend: Arc<dyn Backend>) -> Self {
        Self::build(name.into(), backend, CacheConfig::default())
    }

    /// Create a cache with custom configuration
    pub fn with_config(name: impl Into<String>, backend: Arc<dyn Backend>, config: CacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(name.into(), backend, config))
    }

    fn build(name: String, backend: Arc<dyn Backend>, config: CacheConfig) -> Self {
        Self {
            local: LocalTier::with_config(config.local.clone()),
            database: DatabaseTier::new(name.clone(), backend),
            engine: UpdateEngine::new(config.retry.clone()),
            name,
            dependencies: Vec::new(),
            config,
            metrics: Arc::new(CacheMetrics::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Declare that this cache needs `dependency` started first
    pub fn depends_on(mut self, dependency: impl Into<String>) -> Self {
        let dependency = dependency.into();
        if !self.dependencies.contains(&dependency) {
            self.dependencies.push(dependency);
        }
        self
    }

    /// Cache name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared dependencies
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    /// Get configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn ensure_available(&self) -> Result<()> {
        if !self.database.can_cache() {
            return Err(Error::BackendUnavailable(format!(
                "{} cannot serve cache {}",
                self.database.backend().name(),
                self.name
            )));
        }
        Ok(())
    }

    fn not_found(&self, key: &E::Key) -> Error {
        Error::NotFound {
            cache: self.name.clone(),
            key: format!("{key:?}"),
        }
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Read through both tiers, caching backend hits per configuration
    pub async fn read(&self, key: &E::Key) -> Result<Option<Handle<E>>> {
        self.read_with(key, self.config.cache_on_read).await
    }

    /// Read through both tiers; `cache_on_hit` decides whether a backend hit
    /// is kept in the local tier
    pub async fn read_with(&self, key: &E::Key, cache_on_hit: bool) -> Result<Option<Handle<E>>> {
        if let Some(handle) = self.local.get(key) {
            self.metrics.record_local_hit();
            return Ok(Some(handle));
        }
        self.metrics.record_local_miss();
        self.ensure_available()?;

        let tracker = LatencyTracker::start();
        let record = self.database.get(key).await?;
        self.metrics.record_database_read_latency(tracker.elapsed());

        match record {
            Some(record) => {
                self.metrics.record_database_hit();
                Ok(Some(self.hydrate(record, cache_on_hit)))
            }
            None => {
                self.metrics.record_database_miss();
                Ok(None)
            }
        }
    }

    /// Wrap a loaded record, converging on an already cached reference
    fn hydrate(&self, record: Record<E>, cache: bool) -> Handle<E> {
        if !cache {
            return Handle::new(record);
        }
        self.database.cache_indexes(&record);
        self.local.save_if_absent(Handle::new(record))
    }

    /// Every entity: cached ones plus persisted ones not cached yet
    pub async fn read_all(&self, cache_results: bool) -> Result<Vec<Handle<E>>> {
        self.ensure_available()?;
        let mut handles = self.local.handles();
        let cached: HashSet<E::Key> = handles.iter().map(|h| h.key().clone()).collect();

        let mut records = self.database.records().await?;
        while let Some(record) = records.try_next().await? {
            if !cached.contains(record.key()) {
                handles.push(self.hydrate(record, cache_results));
            }
        }
        Ok(handles)
    }

    /// Keys known to either tier
    pub async fn keys(&self) -> Result<Vec<E::Key>> {
        let mut seen: HashSet<E::Key> = self.local.keys().into_iter().collect();
        let mut keys: Vec<E::Key> = seen.iter().cloned().collect();
        let mut stored = self.database.keys().await?;
        while let Some(key) = stored.try_next().await? {
            if seen.insert(key.clone()) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    /// Number of persisted entities
    pub async fn size(&self) -> Result<u64> {
        self.database.size().await
    }

    /// Number of locally cached entities
    pub fn local_size(&self) -> usize {
        self.local.len()
    }

    /// Whether either tier holds `key`
    pub async fn has(&self, key: &E::Key) -> Result<bool> {
        if self.local.contains(key) {
            return Ok(true);
        }
        self.database.has(key).await
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Create and persist a new entity at version 0.
    ///
    /// `init` runs once on a private writable copy. Fails with `DuplicateKey`
    /// if the backend already holds `key` and with `UniqueViolation` if a
    /// registered index value is taken by another entity.
    pub async fn create<F>(&self, key: E::Key, init: F) -> Result<Handle<E>>
    where
        F: FnOnce(&mut E) -> Result<()>,
    {
        self.ensure_available()?;
        let mut record = Record::assemble(key, E::default())?;
        init(record.entity_mut())?;
        record.set_version(0)?;
        record.set_read_only(true);

        self.database.insert(&record).await?;
        self.metrics.record_create();
        debug!(cache = %self.name, key = ?record.key(), "Created entity");

        let handle = Handle::new(record);
        self.local.save(handle.clone());
        Ok(handle)
    }

    /// Read `key`, creating it with `init` if absent.
    ///
    /// Not atomic: when a concurrent creator wins, the resulting
    /// `DuplicateKey` is answered with a fresh read.
    pub async fn read_or_create<F>(&self, key: E::Key, init: F) -> Result<Handle<E>>
    where
        F: FnOnce(&mut E) -> Result<()>,
    {
        if let Some(handle) = self.read(&key).await? {
            return Ok(handle);
        }
        match self.create(key.clone(), init).await {
            Err(Error::DuplicateKey { .. }) => {
                self.read(&key).await?.ok_or_else(|| self.not_found(&key))
            }
            other => other,
        }
    }

    /// Apply `mutation` to `key` with optimistic concurrency.
    ///
    /// The returned handle is the cached reference; every holder of it sees
    /// the committed values.
    pub async fn update<F>(&self, key: &E::Key, mutation: F) -> Result<Handle<E>>
    where
        F: FnMut(&mut E) -> Result<()> + Send,
    {
        let handle = self.read(key).await?.ok_or_else(|| self.not_found(key))?;
        self.update_handle(&handle, mutation).await?;
        Ok(handle)
    }

    /// Apply `mutation` to the entity behind `handle`.
    ///
    /// `mutation` may run more than once, each time on a fresh copy of the
    /// latest stored state. On `RetryLimitExceeded` neither the handle nor
    /// the stored record has changed.
    ///
    /// If the entity is deleted while the winning attempt is in flight, the
    /// commit still counts: the outcome is returned and the invalidated
    /// handle is left as it was.
    #[instrument(skip_all, fields(cache = %self.name, key = ?handle.key()))]
    pub async fn update_handle<F>(&self, handle: &Handle<E>, mutation: F) -> Result<UpdateOutcome>
    where
        F: FnMut(&mut E) -> Result<()> + Send,
    {
        self.ensure_available()?;
        let tracker = LatencyTracker::start();
        let outcome = self
            .engine
            .execute(&self.name, &self.database, &self.metrics, handle, mutation)
            .await?;
        self.metrics.record_update_latency(tracker.elapsed());

        if handle.is_valid() {
            self.cache(handle);
        }
        Ok(outcome)
    }

    /// Run an update on the runtime's worker pool
    pub fn spawn_update<F>(self: &Arc<Self>, key: E::Key, mutation: F) -> JoinHandle<Result<Handle<E>>>
    where
        F: FnMut(&mut E) -> Result<()> + Send + 'static,
    {
        let cache = Arc::clone(self);
        tokio::spawn(async move { cache.update(&key, mutation).await })
    }

    /// Remove `key` from both tiers and invalidate its handle. Deleting an
    /// absent key is not an error; returns whether anything was removed.
    ///
    /// The local tier is only touched once the backend removal succeeded, so
    /// a failed delete leaves held handles valid.
    pub async fn delete(&self, key: &E::Key) -> Result<bool> {
        let stored = self.database.remove(key).await?;
        let cached = self.local.remove(key);
        self.database.invalidate_indexes(key);
        if cached || stored {
            self.metrics.record_delete();
            debug!(cache = %self.name, key = ?key, "Deleted entity");
        }
        Ok(cached || stored)
    }

    /// [`Cache::delete`] by handle
    pub async fn delete_handle(&self, handle: &Handle<E>) -> Result<bool> {
        let deleted = self.delete(handle.key()).await?;
        handle.invalidate();
        Ok(deleted)
    }

    // =========================================================================
    // Manual local tier control
    // =========================================================================

    /// Put `handle` into the local tier. If a different reference is cached
    /// for the same key, `handle`'s values are merged into it instead.
    ///
    /// Returns `false` for invalidated handles.
    pub fn cache(&self, handle: &Handle<E>) -> bool {
        if !handle.is_valid() {
            return self.local.save(handle.clone());
        }
        match self.local.peek(handle.key()) {
            Some(cached) if cached.ptr_eq(handle) => true,
            Some(cached) => cached.merge_from(&handle.snapshot()).is_ok(),
            None => {
                let saved = self.local.save(handle.clone());
                debug!(cache = %self.name, key = ?handle.key(), "Cached entity");
                saved
            }
        }
    }

    /// Drop `key` from the local tier, invalidating the cached handle
    pub fn uncache(&self, key: &E::Key) -> bool {
        self.local.remove(key)
    }

    /// [`Cache::uncache`] by handle
    pub fn uncache_handle(&self, handle: &Handle<E>) -> bool {
        self.uncache(handle.key())
    }

    /// Whether `key` is in the local tier
    pub fn is_cached(&self, key: &E::Key) -> bool {
        self.local.contains(key)
    }

    // =========================================================================
    // Indexes
    // =========================================================================

    /// Register a secondary index
    pub async fn register_index<T: IndexValue>(&self, index: &Index<E, T>) -> Result<()> {
        self.database.register_index(index).await?;
        for handle in self.local.handles() {
            self.database.cache_indexes(&handle.read());
        }
        info!(cache = %self.name, index = index.name(), "Registered index");
        Ok(())
    }

    /// Find the entity whose indexed value equals `value`.
    ///
    /// The local tier is scanned first. Otherwise the backend resolves the
    /// id, the entity is read normally and re-checked, so a stale index
    /// yields `None` rather than a wrong match.
    pub async fn get_by_index<T: IndexValue>(&self, index: &Index<E, T>, value: &T) -> Result<Option<Handle<E>>> {
        let local = self
            .local
            .handles()
            .into_iter()
            .find(|handle| index.matches(&handle.entity(), value));
        if let Some(handle) = local {
            return Ok(Some(handle));
        }

        self.ensure_available()?;
        let Some(key) = self.database.id_by_index(index, value).await? else {
            return Ok(None);
        };
        let Some(handle) = self.read(&key).await? else {
            return Ok(None);
        };
        if index.matches(&handle.entity(), value) {
            Ok(Some(handle))
        } else {
            debug!(cache = %self.name, index = index.name(), key = ?key, "Index entry is stale");
            Ok(None)
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Mark the cache running
    pub fn start(&self) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(Error::invariant(format!("cache {} is already running", self.name)));
        }
        info!(cache = %self.name, backend = self.database.backend().name(), "Cache started");
        Ok(())
    }

    /// Stop the cache and drop the local tier; the backend is untouched
    pub fn shutdown(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::AcqRel) {
            return Err(Error::invariant(format!("cache {} is not running", self.name)));
        }
        let dropped = self.local.clear();
        info!(cache = %self.name, dropped, "Cache stopped");
        Ok(())
    }

    /// Whether [`Cache::start`] ran without a matching shutdown
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    // =========================================================================
    // Observability
    // =========================================================================

    /// Get metrics snapshot
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Local tier statistics
    pub fn local_stats(&self) -> LocalTierStats {
        self.local.stats()
    }

    /// Backend latency and connectivity
    pub fn backend_health(&self) -> BackendHealth {
        self.database.health()
    }

    /// Name of the backend serving this cache
    pub fn backend_name(&self) -> &str {
        self.database.backend().name()
    }
}

// =============================================================================
// Tests
// =============================================================================
