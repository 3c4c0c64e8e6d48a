//! Fault Injection
//!
//! Wraps any [`Backend`] and perturbs the conditional-replace path so the
//! update engine's retry behavior can be exercised deterministically:
//! forced lost races, transient transport errors and full outages.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::monitor::BackendHealth;
use super::{Backend, BackendStats, DocumentStream, KeyStream};
use crate::entity::Document;
use crate::error::{Error, Result};

/// Counts of injected faults
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FaultStats {
    /// Conditional replaces reported as lost without reaching the inner backend
    pub injected_conflicts: u64,
    /// Transient errors returned instead of a result
    pub injected_errors: u64,
}

/// Backend wrapper that injects failures
pub struct FaultInjectingBackend {
    inner: Arc<dyn Backend>,
    fail_next_cas: AtomicU32,
    always_fail_cas: AtomicBool,
    transient_next_cas: AtomicU32,
    /// Probability in [0, 1] of a forced lost race
    conflict_rate: Mutex<f64>,
    outage: AtomicBool,
    injected_conflicts: AtomicU64,
    injected_errors: AtomicU64,
}

impl FaultInjectingBackend {
    /// Wrap `inner`; no faults are active until configured
    pub fn new(inner: Arc<dyn Backend>) -> Self {
        Self {
            inner,
            fail_next_cas: AtomicU32::new(0),
            always_fail_cas: AtomicBool::new(false),
            transient_next_cas: AtomicU32::new(0),
            conflict_rate: Mutex::new(0.0),
            outage: AtomicBool::new(false),
            injected_conflicts: AtomicU64::new(0),
            injected_errors: AtomicU64::new(0),
        }
    }

    /// Report the next `count` conditional replaces as lost races
    pub fn fail_next_cas(&self, count: u32) {
        self.fail_next_cas.store(count, Ordering::SeqCst);
    }

    /// Report every conditional replace as a lost race
    pub fn always_fail_cas(&self, enabled: bool) {
        self.always_fail_cas.store(enabled, Ordering::SeqCst);
    }

    /// Fail the next `count` conditional replaces with a transient error
    pub fn transient_next_cas(&self, count: u32) {
        self.transient_next_cas.store(count, Ordering::SeqCst);
    }

    /// Randomly lose conditional replaces with probability `rate`
    pub fn set_conflict_rate(&self, rate: f64) {
        *self.conflict_rate.lock() = rate.clamp(0.0, 1.0);
    }

    /// Simulate a full outage: every call fails and `can_cache()` is false
    pub fn set_outage(&self, outage: bool) {
        self.outage.store(outage, Ordering::SeqCst);
    }

    /// Injection counters
    pub fn fault_stats(&self) -> FaultStats {
        FaultStats {
            injected_conflicts: self.injected_conflicts.load(Ordering::Relaxed),
            injected_errors: self.injected_errors.load(Ordering::Relaxed),
        }
    }

    fn check_outage(&self) -> Result<()> {
        if self.outage.load(Ordering::SeqCst) {
            self.injected_errors.fetch_add(1, Ordering::Relaxed);
            return Err(Error::TransientBackend(format!(
                "{} is unreachable",
                self.inner.name()
            )));
        }
        Ok(())
    }

    /// Atomically consume one unit of a countdown
    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn forced_conflict(&self) -> bool {
        if self.always_fail_cas.load(Ordering::SeqCst) || Self::take(&self.fail_next_cas) {
            return true;
        }
        let rate = *self.conflict_rate.lock();
        rate > 0.0 && rand::rng().random_bool(rate)
    }
}

#[async_trait]
impl Backend for FaultInjectingBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>> {
        self.check_outage()?;
        self.inner.get(collection, id).await
    }

    async fn insert(&self, collection: &str, id: &str, document: Document) -> Result<()> {
        self.check_outage()?;
        self.inner.insert(collection, id, document).await
    }

    async fn has(&self, collection: &str, id: &str) -> Result<bool> {
        self.check_outage()?;
        self.inner.has(collection, id).await
    }

    async fn remove(&self, collection: &str, id: &str) -> Result<bool> {
        self.check_outage()?;
        self.inner.remove(collection, id).await
    }

    async fn documents(&self, collection: &str) -> Result<DocumentStream> {
        self.check_outage()?;
        self.inner.documents(collection).await
    }

    async fn keys(&self, collection: &str) -> Result<KeyStream> {
        self.check_outage()?;
        self.inner.keys(collection).await
    }

    async fn size(&self, collection: &str) -> Result<u64> {
        self.check_outage()?;
        self.inner.size(collection).await
    }

    async fn replace_if_version(
        &self,
        collection: &str,
        id: &str,
        expected_version: i64,
        document: Document,
    ) -> Result<bool> {
        self.check_outage()?;
        if Self::take(&self.transient_next_cas) {
            self.injected_errors.fetch_add(1, Ordering::Relaxed);
            debug!(collection, id, expected_version, "Injected transient error");
            return Err(Error::TransientBackend("injected transport failure".to_string()));
        }
        if self.forced_conflict() {
            self.injected_conflicts.fetch_add(1, Ordering::Relaxed);
            debug!(collection, id, expected_version, "Injected lost race");
            return Ok(false);
        }
        self.inner
            .replace_if_version(collection, id, expected_version, document)
            .await
    }

    fn can_cache(&self) -> bool {
        !self.outage.load(Ordering::SeqCst) && self.inner.can_cache()
    }

    fn supports_native_indexes(&self) -> bool {
        self.inner.supports_native_indexes()
    }

    async fn register_index(&self, collection: &str, field: &str) -> Result<()> {
        self.check_outage()?;
        self.inner.register_index(collection, field).await
    }

    async fn id_by_index(&self, collection: &str, field: &str, value: &Value) -> Result<Option<String>> {
        self.check_outage()?;
        self.inner.id_by_index(collection, field, value).await
    }

    fn health(&self) -> BackendHealth {
        let mut health = self.inner.health();
        if self.outage.load(Ordering::SeqCst) {
            health.connected = false;
        }
        health
    }

    fn stats(&self) -> BackendStats {
        self.inner.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn doc(version: i64) -> Document {
        json!({ "_id": "k", "version": version }).as_object().cloned().unwrap()
    }

    async fn seeded() -> (Arc<InMemoryBackend>, FaultInjectingBackend) {
        let inner = Arc::new(InMemoryBackend::new());
        inner.insert("c", "k", doc(0)).await.unwrap();
        let faults = FaultInjectingBackend::new(inner.clone());
        (inner, faults)
    }

    #[tokio::test]
    async fn test_fail_next_cas_counts_down() {
        let (inner, faults) = seeded().await;
        faults.fail_next_cas(2);

        assert!(!faults.replace_if_version("c", "k", 0, doc(1)).await.unwrap());
        assert!(!faults.replace_if_version("c", "k", 0, doc(1)).await.unwrap());
        assert!(faults.replace_if_version("c", "k", 0, doc(1)).await.unwrap());

        assert_eq!(faults.fault_stats().injected_conflicts, 2);
        // Injected conflicts never reach the inner backend
        assert_eq!(inner.stats().cas_attempts, 1);
    }

    #[tokio::test]
    async fn test_always_fail_cas() {
        let (_inner, faults) = seeded().await;
        faults.always_fail_cas(true);
        for _ in 0..5 {
            assert!(!faults.replace_if_version("c", "k", 0, doc(1)).await.unwrap());
        }
        faults.always_fail_cas(false);
        assert!(faults.replace_if_version("c", "k", 0, doc(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_transient_errors() {
        let (_inner, faults) = seeded().await;
        faults.transient_next_cas(1);

        let err = faults.replace_if_version("c", "k", 0, doc(1)).await.unwrap_err();
        assert!(err.is_transient());
        assert!(faults.replace_if_version("c", "k", 0, doc(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_outage_blocks_everything() {
        let (_inner, faults) = seeded().await;
        faults.set_outage(true);

        assert!(!faults.can_cache());
        assert!(!faults.health().connected);
        assert_matches!(faults.get("c", "k").await, Err(Error::TransientBackend(_)));

        faults.set_outage(false);
        assert!(faults.can_cache());
        assert!(faults.get("c", "k").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_full_conflict_rate() {
        let (_inner, faults) = seeded().await;
        faults.set_conflict_rate(1.0);
        assert!(!faults.replace_if_version("c", "k", 0, doc(1)).await.unwrap());

        faults.set_conflict_rate(0.0);
        assert!(faults.replace_if_version("c", "k", 0, doc(1)).await.unwrap());
    }
}
