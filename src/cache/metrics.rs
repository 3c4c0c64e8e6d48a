//! Cache Metrics Collection
//!
//! Per-cache counters for the read path, the mutation path and the update
//! engine's retry loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Cache metrics collector
#[derive(Debug, Default)]
pub struct CacheMetrics {
    // Read path
    local_hits: AtomicU64,
    local_misses: AtomicU64,
    database_hits: AtomicU64,
    database_misses: AtomicU64,

    // Mutations
    creates: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,

    // Update engine
    cas_conflicts: AtomicU64,
    transient_retries: AtomicU64,
    exhausted_updates: AtomicU64,

    // Latencies (microseconds, exponential moving average)
    database_read_latency_us: AtomicU64,
    update_latency_us: AtomicU64,
}

impl CacheMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_local_hit(&self) {
        self.local_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_local_miss(&self) {
        self.local_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_database_hit(&self) {
        self.database_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_database_miss(&self) {
        self.database_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_create(&self) {
        self.creates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_update(&self) {
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cas_conflict(&self) {
        self.cas_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_transient_retry(&self) {
        self.transient_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_exhausted_update(&self) {
        self.exhausted_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn local_hits(&self) -> u64 {
        self.local_hits.load(Ordering::Relaxed)
    }

    pub fn local_misses(&self) -> u64 {
        self.local_misses.load(Ordering::Relaxed)
    }

    pub fn cas_conflicts(&self) -> u64 {
        self.cas_conflicts.load(Ordering::Relaxed)
    }

    /// Share of reads served without touching the backend
    pub fn local_hit_ratio(&self) -> f64 {
        let hits = self.local_hits() as f64;
        let total = hits + self.local_misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    pub fn record_database_read_latency(&self, duration: Duration) {
        Self::update_latency_ema(&self.database_read_latency_us, duration);
    }

    pub fn record_update_latency(&self, duration: Duration) {
        Self::update_latency_ema(&self.update_latency_us, duration);
    }

    fn update_latency_ema(target: &AtomicU64, duration: Duration) {
        let new_us = duration.as_micros() as u64;
        let alpha = 0.1; // EMA smoothing factor

        loop {
            let current = target.load(Ordering::Relaxed);
            let updated = if current == 0 {
                new_us
            } else {
                ((1.0 - alpha) * current as f64 + alpha * new_us as f64) as u64
            };

            if target
                .compare_exchange_weak(current, updated, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
    }

    /// Get snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            local_hits: self.local_hits(),
            local_misses: self.local_misses(),
            local_hit_ratio: self.local_hit_ratio(),
            database_hits: self.database_hits.load(Ordering::Relaxed),
            database_misses: self.database_misses.load(Ordering::Relaxed),
            creates: self.creates.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            cas_conflicts: self.cas_conflicts(),
            transient_retries: self.transient_retries.load(Ordering::Relaxed),
            exhausted_updates: self.exhausted_updates.load(Ordering::Relaxed),
            database_read_latency: Duration::from_micros(
                self.database_read_latency_us.load(Ordering::Relaxed),
            ),
            update_latency: Duration::from_micros(self.update_latency_us.load(Ordering::Relaxed)),
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        for counter in [
            &self.local_hits,
            &self.local_misses,
            &self.database_hits,
            &self.database_misses,
            &self.creates,
            &self.updates,
            &self.deletes,
            &self.cas_conflicts,
            &self.transient_retries,
            &self.exhausted_updates,
            &self.database_read_latency_us,
            &self.update_latency_us,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Snapshot of all cache metrics
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub local_hits: u64,
    pub local_misses: u64,
    pub local_hit_ratio: f64,
    pub database_hits: u64,
    pub database_misses: u64,
    pub creates: u64,
    pub updates: u64,
    pub deletes: u64,
    pub cas_conflicts: u64,
    pub transient_retries: u64,
    pub exhausted_updates: u64,
    pub database_read_latency: Duration,
    pub update_latency: Duration,
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================
