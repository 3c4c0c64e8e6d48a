//! Health Checks
//!
//! Readiness snapshot of every registered cache and its backend. Purely
//! informational: the only behavior that depends on backend readiness is
//! the `can_cache()` gate inside the cache itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backend::BackendHealth;
use crate::registry::{ManagedCache, Registry};

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Running against a connected backend
    Healthy,
    /// Usable but not fully ready
    Degraded,
    /// Backend unreachable
    Unhealthy,
}

impl HealthStatus {
    /// Check if status is healthy or degraded (operational)
    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }

    pub fn is_healthy(&self) -> bool {
        *self == HealthStatus::Healthy
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Degraded => write!(f, "Degraded"),
            HealthStatus::Unhealthy => write!(f, "Unhealthy"),
        }
    }
}

/// One cache's readiness
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResult {
    /// Cache name
    pub name: String,
    pub backend: String,
    pub status: HealthStatus,
    pub running: bool,
    pub connected: bool,
    pub average_latency_us: u64,
    pub message: Option<String>,
}

impl HealthCheckResult {
    /// Classify a cache from its running flag and backend health
    pub fn evaluate(name: &str, backend: &str, running: bool, health: BackendHealth) -> Self {
        let (status, message) = if !health.connected {
            (HealthStatus::Unhealthy, Some(format!("backend {backend} is disconnected")))
        } else if !running {
            (HealthStatus::Degraded, Some("cache is not running".to_string()))
        } else if !health.initial_connect_succeeded {
            (HealthStatus::Degraded, Some("initial backend connection failed".to_string()))
        } else {
            (HealthStatus::Healthy, None)
        };

        Self {
            name: name.to_string(),
            backend: backend.to_string(),
            status,
            running,
            connected: health.connected,
            average_latency_us: health.average_latency.as_micros() as u64,
            message,
        }
    }

    /// Check a registered cache
    pub fn check(cache: &dyn ManagedCache) -> Self {
        Self::evaluate(
            cache.name(),
            cache.backend_name(),
            cache.is_running(),
            cache.backend_health(),
        )
    }
}

/// Overall health report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Worst status among the checks
    pub status: HealthStatus,
    pub checks: Vec<HealthCheckResult>,
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

impl HealthReport {
    pub fn new(checks: Vec<HealthCheckResult>) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);

        Self {
            status,
            checks,
            timestamp: Utc::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Check every cache of `registry`, in name order
    pub fn collect(registry: &Registry) -> Self {
        let checks = registry
            .names()
            .iter()
            .filter_map(|name| registry.get(name))
            .map(|cache| HealthCheckResult::check(cache.as_ref()))
            .collect();
        Self::new(checks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{FaultInjectingBackend, InMemoryBackend};
    use crate::cache::Cache;
    use crate::test_support::User;
    use std::sync::Arc;

    #[test]
    fn test_status_ordering() {
        assert!(HealthStatus::Healthy < HealthStatus::Degraded);
        assert!(HealthStatus::Degraded.is_operational());
        assert!(!HealthStatus::Unhealthy.is_operational());
    }

    #[test]
    fn test_report_takes_worst_status() {
        let registry = Registry::new();
        let users = registry
            .register_cache(Cache::<User>::new("users", Arc::new(InMemoryBackend::new())))
            .unwrap();
        let faults = Arc::new(FaultInjectingBackend::new(Arc::new(InMemoryBackend::new())));
        registry
            .register_cache(Cache::<User>::new("orders", faults.clone()))
            .unwrap();

        users.start().unwrap();
        let report = HealthReport::collect(&registry);
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.checks.len(), 2);
        assert_eq!(report.checks[1].name, "users");
        assert!(report.checks[1].status.is_healthy());

        faults.set_outage(true);
        let report = HealthReport::collect(&registry);
        assert_eq!(report.status, HealthStatus::Unhealthy);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "Unhealthy");
    }

    #[test]
    fn test_empty_report_is_healthy() {
        assert!(HealthReport::new(Vec::new()).status.is_healthy());
    }
}
