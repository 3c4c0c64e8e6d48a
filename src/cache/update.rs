//! Update Engine - Optimistic Concurrency Control
//!
//! Every update runs against a private working copy and commits with a
//! conditional replace keyed on `(id, version)`:
//!
//! ```text
//! base = snapshot(handle)
//! loop attempt in 0..max_attempts:
//!     working = thaw(clone(base)); v = working.version
//!     mutation(working); working.version = v + 1
//!     replace_if_version(working, v)
//!         matched      → merge working into handle, done
//!         lost race    → base = re-read from backend, backoff, retry
//!         transient    → backoff, retry with the same base
//! exhausted → RetryLimitExceeded (handle and stored record untouched)
//! ```
//!
//! Backoff grows linearly (`base + step * attempt`), never drops below the
//! backend's scaled half round-trip, is clamped to `max_delay` and then
//! jittered by up to ±`jitter`.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use super::database::DatabaseTier;
use super::metrics::CacheMetrics;
use crate::entity::{Entity, Handle, Record};
use crate::error::{Error, Result};

/// Default bound on compare-and-swap attempts
pub const DEFAULT_MAX_ATTEMPTS: u32 = 15;

/// Retry and backoff policy
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts before giving up
    pub max_attempts: u32,
    /// Delay after the first lost attempt
    pub base_delay: Duration,
    /// Added per further attempt
    pub step: Duration,
    /// Upper clamp before jitter
    pub max_delay: Duration,
    /// Jitter fraction in [0, 1)
    pub jitter: f64,
    /// Scale applied to half the backend round-trip for the backoff floor
    pub latency_multiplier: f64,
    /// Deadline for the whole update, unbounded when `None`
    pub operation_timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(50),
            step: Duration::from_millis(25),
            max_delay: Duration::from_secs(2),
            jitter: 0.25,
            latency_multiplier: 2.0,
            operation_timeout: None,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_delays(mut self, base_delay: Duration, step: Duration, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.step = step;
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_latency_multiplier(mut self, latency_multiplier: f64) -> Self {
        self.latency_multiplier = latency_multiplier;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = Some(timeout);
        self
    }

    /// Reject nonsensical values
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".into()));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(Error::Config(format!("jitter {} outside [0, 1)", self.jitter)));
        }
        if self.base_delay > self.max_delay {
            return Err(Error::Config(format!(
                "base delay {:?} exceeds max delay {:?}",
                self.base_delay, self.max_delay
            )));
        }
        if !self.latency_multiplier.is_finite() || self.latency_multiplier < 0.0 {
            return Err(Error::Config(format!(
                "latency multiplier {} must be a non-negative number",
                self.latency_multiplier
            )));
        }
        if self.operation_timeout == Some(Duration::ZERO) {
            return Err(Error::Config("operation timeout must be positive".into()));
        }
        Ok(())
    }

    /// Delay before retrying after `attempt` (0-based) failed, without jitter
    pub fn delay(&self, attempt: u32, average_latency: Duration) -> Duration {
        let linear = self.base_delay.saturating_add(self.step.saturating_mul(attempt));
        let floor = (average_latency / 2).mul_f64(self.latency_multiplier);
        linear.max(floor).min(self.max_delay)
    }

    /// [`RetryPolicy::delay`] with up to ±`jitter` applied
    pub fn backoff(&self, attempt: u32, average_latency: Duration) -> Duration {
        let delay = self.delay(attempt, average_latency);
        let spread = delay.as_secs_f64() * self.jitter;
        if spread <= 0.0 {
            return delay;
        }
        let offset = rand::rng().random_range(-spread..=spread);
        Duration::from_secs_f64((delay.as_secs_f64() + offset).max(0.0))
    }
}

/// Result of a committed update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// Version now stored and visible through the handle
    pub version: i64,
    /// Attempts used, including the successful one
    pub attempts: u32,
}

/// Runs the compare-and-swap loop for one cache
pub struct UpdateEngine {
    policy: RetryPolicy,
}

impl UpdateEngine {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Apply `mutation` to the entity behind `handle` and commit it.
    ///
    /// `mutation` may run once per attempt, each time on a fresh working
    /// copy. An error from it aborts the update without retrying.
    pub async fn execute<E, F>(
        &self,
        cache: &str,
        database: &DatabaseTier<E>,
        metrics: &CacheMetrics,
        handle: &Handle<E>,
        mutation: F,
    ) -> Result<UpdateOutcome>
    where
        E: Entity,
        F: FnMut(&mut E) -> Result<()> + Send,
    {
        let run = self.run(cache, database, metrics, handle, mutation);
        match self.policy.operation_timeout {
            Some(limit) => tokio::time::timeout(limit, run)
                .await
                .map_err(|_| Error::Timeout {
                    cache: cache.to_string(),
                    key: format!("{:?}", handle.key()),
                    after: limit,
                })?,
            None => run.await,
        }
    }

    async fn run<E, F>(
        &self,
        cache: &str,
        database: &DatabaseTier<E>,
        metrics: &CacheMetrics,
        handle: &Handle<E>,
        mut mutation: F,
    ) -> Result<UpdateOutcome>
    where
        E: Entity,
        F: FnMut(&mut E) -> Result<()> + Send,
    {
        handle.ensure_valid()?;
        let key = handle.key();
        let mut base: Record<E> = handle.snapshot();
        let mut observed_version = base.version();

        for attempt in 0..self.policy.max_attempts {
            let mut working = base.clone();
            working.set_read_only(false);
            let version = working.version();
            mutation(working.entity_mut())?;
            working.set_version(version + 1)?;
            working.set_read_only(true);

            match database.replace_if_version(&working, version).await {
                Ok(true) => {
                    if let Err(e) = handle.merge_from(&working) {
                        if handle.is_valid() {
                            return Err(e);
                        }
                        warn!(
                            cache,
                            key = ?key,
                            version = version + 1,
                            "Entity was deleted while its update committed, handle left unchanged"
                        );
                    }
                    metrics.record_update();
                    debug!(cache, key = ?key, version = version + 1, attempts = attempt + 1, "Update committed");
                    return Ok(UpdateOutcome {
                        version: version + 1,
                        attempts: attempt + 1,
                    });
                }
                Ok(false) => {
                    metrics.record_cas_conflict();
                    debug!(cache, key = ?key, attempt, expected_version = version, "Lost compare-and-swap race");
                    match database.get(key).await {
                        Ok(Some(current)) => {
                            observed_version = current.version();
                            base = current;
                        }
                        Ok(None) => {
                            return Err(Error::NotFound {
                                cache: cache.to_string(),
                                key: format!("{key:?}"),
                            })
                        }
                        Err(e) if e.is_transient() => {
                            metrics.record_transient_retry();
                            debug!(cache, key = ?key, attempt, error = %e, "Re-read failed, retrying from last base");
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) if e.is_transient() => {
                    metrics.record_transient_retry();
                    debug!(cache, key = ?key, attempt, error = %e, "Transient backend error during update");
                }
                Err(e) => return Err(e),
            }

            if attempt + 1 < self.policy.max_attempts {
                let delay = self.policy.backoff(attempt, database.health().average_latency);
                tokio::time::sleep(delay).await;
            }
        }

        metrics.record_exhausted_update();
        warn!(
            cache,
            key = ?key,
            attempts = self.policy.max_attempts,
            observed_version,
            "Update gave up after exhausting retries"
        );
        Err(Error::RetryLimitExceeded {
            cache: cache.to_string(),
            key: format!("{key:?}"),
            attempts: self.policy.max_attempts,
            observed_version,
        })
    }
}

// =============================================================================
// Tests
// =============================================================================
