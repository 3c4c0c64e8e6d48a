//! Local Tier - In-Memory Entity Cache
//!
//! Concurrent map from key to shared [`Handle`]. No I/O.
//!
//! # Design
//!
//! - `DashMap` for lock-free reads across shards
//! - Optional capacity with deterministic LRU: every access stamps a
//!   monotonic tick, and overflow evicts the oldest ticks in one batch down
//!   to the low watermark
//! - Optional TTL measured from insertion
//! - Capacity and TTL eviction only drop the slot; the entity still exists
//!   and its handle stays valid. `remove` invalidates.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::entity::{Entity, Handle};
use crate::error::{Error, Result};

/// Local tier configuration
#[derive(Debug, Clone)]
pub struct LocalTierConfig {
    /// Maximum number of entries, unbounded when `None`
    pub capacity: Option<usize>,
    /// Fraction of capacity to evict down to
    pub low_watermark: f64,
    /// Upper bound on entries evicted in one pass
    pub eviction_batch_size: usize,
    /// Entry lifetime from insertion
    pub ttl: Option<Duration>,
}

impl Default for LocalTierConfig {
    fn default() -> Self {
        Self {
            capacity: None,
            low_watermark: 0.90,
            eviction_batch_size: 1000,
            ttl: None,
        }
    }
}

impl LocalTierConfig {
    /// Bound the tier to `capacity` entries
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Expire entries `ttl` after insertion
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Reject nonsensical values
    pub fn validate(&self) -> Result<()> {
        if self.capacity == Some(0) {
            return Err(Error::Config("local tier capacity must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.low_watermark) {
            return Err(Error::Config(format!(
                "low watermark {} outside [0, 1]",
                self.low_watermark
            )));
        }
        if self.eviction_batch_size == 0 {
            return Err(Error::Config("eviction batch size must be positive".into()));
        }
        Ok(())
    }
}

struct Slot<E: Entity> {
    handle: Handle<E>,
    inserted: Instant,
    last_access: AtomicU64,
}

/// In-memory tier of one cache
pub struct LocalTier<E: Entity> {
    entries: DashMap<E::Key, Slot<E>>,
    config: LocalTierConfig,
    /// Monotonic access clock
    tick: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<E: Entity> LocalTier<E> {
    /// Create an unbounded tier
    pub fn new() -> Self {
        Self::with_config(LocalTierConfig::default())
    }

    /// Create a tier with custom configuration
    pub fn with_config(config: LocalTierConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            tick: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn next_tick(&self) -> u64 {
        self.tick.fetch_add(1, Ordering::Relaxed)
    }

    fn is_expired(&self, slot: &Slot<E>) -> bool {
        self.config
            .ttl
            .is_some_and(|ttl| slot.inserted.elapsed() >= ttl)
    }

    /// Look up a handle, counting the hit or miss
    pub fn get(&self, key: &E::Key) -> Option<Handle<E>> {
        match self.lookup(key) {
            Some(handle) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(handle)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Look up a handle without touching hit/miss counters
    pub fn peek(&self, key: &E::Key) -> Option<Handle<E>> {
        self.lookup(key)
    }

    fn lookup(&self, key: &E::Key) -> Option<Handle<E>> {
        let expired = {
            let slot = self.entries.get(key)?;
            if !self.is_expired(&slot) {
                slot.last_access.store(self.next_tick(), Ordering::Relaxed);
                return Some(slot.handle.clone());
            }
            true
        };
        if expired && self.entries.remove_if(key, |_, slot| self.is_expired(slot)).is_some() {
            self.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(key = ?key, "Local entry expired");
        }
        None
    }

    /// Insert or replace the handle for its key.
    ///
    /// Returns `false` without caching when the handle was invalidated.
    pub fn save(&self, handle: Handle<E>) -> bool {
        if !handle.is_valid() {
            warn!(key = ?handle.key(), "Refusing to cache an invalidated entity");
            return false;
        }
        self.entries
            .insert(handle.key().clone(), self.slot(handle.clone()));
        self.enforce_capacity();
        true
    }

    /// Cache `handle` unless a live entry for its key exists; returns the
    /// handle that ends up cached. Concurrent hydrations converge on one
    /// reference this way.
    pub fn save_if_absent(&self, handle: Handle<E>) -> Handle<E> {
        if !handle.is_valid() {
            warn!(key = ?handle.key(), "Refusing to cache an invalidated entity");
            return handle;
        }
        let existing = match self.entries.entry(handle.key().clone()) {
            Entry::Occupied(mut occupied) => {
                if self.is_expired(occupied.get()) || !occupied.get().handle.is_valid() {
                    occupied.insert(self.slot(handle.clone()));
                    None
                } else {
                    occupied.get().last_access.store(self.next_tick(), Ordering::Relaxed);
                    Some(occupied.get().handle.clone())
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(self.slot(handle.clone()));
                None
            }
        };
        match existing {
            Some(existing) => existing,
            None => {
                self.enforce_capacity();
                handle
            }
        }
    }

    fn slot(&self, handle: Handle<E>) -> Slot<E> {
        Slot {
            handle,
            inserted: Instant::now(),
            last_access: AtomicU64::new(self.next_tick()),
        }
    }

    fn enforce_capacity(&self) {
        if let Some(capacity) = self.config.capacity {
            if self.entries.len() > capacity {
                self.evict(capacity);
            }
        }
    }

    /// Remove and invalidate the entry. Returns whether one was present.
    pub fn remove(&self, key: &E::Key) -> bool {
        match self.entries.remove(key) {
            Some((_, slot)) => {
                slot.handle.invalidate();
                true
            }
            None => false,
        }
    }

    /// Whether the key is cached
    pub fn contains(&self, key: &E::Key) -> bool {
        self.peek(key).is_some()
    }

    /// All cached handles
    pub fn handles(&self) -> Vec<Handle<E>> {
        self.entries
            .iter()
            .filter(|slot| !self.is_expired(slot.value()))
            .map(|slot| slot.handle.clone())
            .collect()
    }

    /// All cached keys
    pub fn keys(&self) -> Vec<E::Key> {
        self.entries
            .iter()
            .filter(|slot| !self.is_expired(slot.value()))
            .map(|slot| slot.key().clone())
            .collect()
    }

    /// Drop every entry without invalidating and without touching the backend.
    /// Returns how many entries were dropped.
    pub fn clear(&self) -> usize {
        let size = self.entries.len();
        self.entries.clear();
        size
    }

    /// Evict least recently used entries down to the low watermark
    fn evict(&self, capacity: usize) {
        let target = ((capacity as f64) * self.config.low_watermark).floor() as usize;
        let excess = self.entries.len().saturating_sub(target);
        if excess == 0 {
            return;
        }

        // Expired entries go first, then by oldest access tick
        let mut candidates: Vec<(bool, u64, E::Key)> = self
            .entries
            .iter()
            .map(|slot| {
                (
                    !self.is_expired(slot.value()),
                    slot.last_access.load(Ordering::Relaxed),
                    slot.key().clone(),
                )
            })
            .collect();
        candidates.sort_by_key(|(live, tick, _)| (*live, *tick));

        let mut evicted = 0;
        for (_, _, key) in candidates
            .into_iter()
            .take(excess.min(self.config.eviction_batch_size))
        {
            if self.entries.remove(&key).is_some() {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                evicted += 1;
            }
        }
        debug!(evicted, remaining = self.entries.len(), "Local tier eviction");
    }

    /// Get number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if tier is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Get hit count
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Get miss count
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Get eviction count
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Get cache statistics
    pub fn stats(&self) -> LocalTierStats {
        LocalTierStats {
            entries: self.len(),
            capacity: self.config.capacity,
            hits: self.hits(),
            misses: self.misses(),
            evictions: self.evictions(),
        }
    }
}

impl<E: Entity> Default for LocalTier<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Local tier statistics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTierStats {
    /// Number of entries
    pub entries: usize,
    /// Configured capacity
    pub capacity: Option<usize>,
    /// Hit count
    pub hits: u64,
    /// Miss count
    pub misses: u64,
    /// Eviction count (capacity and TTL)
    pub evictions: u64,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{user_record, User};

    fn handle(key: &str) -> Handle<User> {
        Handle::new(user_record(key, key, 1))
    }

    #[test]
    fn test_save_get() {
        let tier = LocalTier::new();
        let h = handle("u1");
        assert!(tier.save(h.clone()));

        let found = tier.get(&"u1".to_string()).unwrap();
        assert!(found.ptr_eq(&h));
        assert_eq!(tier.hits(), 1);

        assert!(tier.get(&"u2".to_string()).is_none());
        assert_eq!(tier.misses(), 1);
    }

    #[test]
    fn test_save_rejects_invalidated() {
        let tier = LocalTier::new();
        let h = handle("u1");
        h.invalidate();
        assert!(!tier.save(h));
        assert!(tier.is_empty());
    }

    #[test]
    fn test_save_if_absent_keeps_first_reference() {
        let tier = LocalTier::new();
        let first = handle("u1");
        let second = handle("u1");

        assert!(tier.save_if_absent(first.clone()).ptr_eq(&first));
        assert!(tier.save_if_absent(second).ptr_eq(&first));
        assert_eq!(tier.len(), 1);
    }

    #[test]
    fn test_remove_invalidates() {
        let tier = LocalTier::new();
        let h = handle("u1");
        tier.save(h.clone());

        assert!(tier.remove(&"u1".to_string()));
        assert!(!h.is_valid());
        assert!(!tier.remove(&"u1".to_string()));
    }

    #[test]
    fn test_clear_keeps_handles_valid() {
        let tier = LocalTier::new();
        let h = handle("u1");
        tier.save(h.clone());
        tier.save(handle("u2"));

        assert_eq!(tier.clear(), 2);
        assert!(tier.is_empty());
        assert!(h.is_valid());
    }

    #[test]
    fn test_lru_eviction_is_deterministic() {
        let tier = LocalTier::with_config(LocalTierConfig {
            capacity: Some(4),
            low_watermark: 0.5,
            ..Default::default()
        });
        for key in ["a", "b", "c", "d"] {
            tier.save(handle(key));
        }
        // Touch "a" so "b" and "c" are the oldest
        tier.get(&"a".to_string());

        let e = handle("e");
        tier.save(e.clone());

        // 5 entries > 4: evict down to 2
        assert_eq!(tier.len(), 2);
        assert!(tier.contains(&"a".to_string()));
        assert!(tier.contains(&"e".to_string()));
        assert_eq!(tier.evictions(), 3);
    }

    #[test]
    fn test_eviction_does_not_invalidate() {
        let tier = LocalTier::with_config(LocalTierConfig::default().with_capacity(1));
        let first = handle("a");
        tier.save(first.clone());
        tier.save(handle("b"));

        assert!(!tier.contains(&"a".to_string()));
        assert!(first.is_valid());
    }

    #[test]
    fn test_ttl_expiry() {
        let tier = LocalTier::with_config(LocalTierConfig::default().with_ttl(Duration::from_millis(20)));
        let h = handle("u1");
        tier.save(h.clone());
        assert!(tier.contains(&"u1".to_string()));

        std::thread::sleep(Duration::from_millis(40));
        assert!(tier.get(&"u1".to_string()).is_none());
        assert_eq!(tier.evictions(), 1);
        assert!(h.is_valid());
    }

    #[test]
    fn test_config_validation() {
        assert!(LocalTierConfig::default().validate().is_ok());
        assert!(LocalTierConfig::default().with_capacity(0).validate().is_err());
        assert!(LocalTierConfig {
            low_watermark: 1.5,
            ..Default::default()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_concurrent_access() {
        use std::sync::Arc;
        use std::thread;

        let tier = Arc::new(LocalTier::<User>::new());

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let tier = Arc::clone(&tier);
                thread::spawn(move || {
                    for i in 0..200 {
                        let key = format!("u-{t}-{i}");
                        tier.save(handle(&key));
                        assert!(tier.get(&key).is_some());
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(tier.len(), 1600);
    }
}
