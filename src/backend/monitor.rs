//! Connection Monitor
//!
//! Tracks per-server round-trip samples and the connection state of one
//! backend. The average latency feeds the update engine's backoff floor and
//! the state flags gate `can_cache()`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info};

/// Latency assumed before the first sample arrives
pub const DEFAULT_AVERAGE_LATENCY: Duration = Duration::from_millis(1);

/// Health surface of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendHealth {
    /// Mean round-trip time across known servers
    pub average_latency: Duration,
    /// Whether a writable server is currently reachable
    pub connected: bool,
    /// Whether the first connection ever succeeded
    pub initial_connect_succeeded: bool,
}

/// Connection state tracker
pub struct ConnectionMonitor {
    samples: RwLock<HashMap<String, Duration>>,
    average_nanos: AtomicU64,
    connected: AtomicBool,
    initial_connect: AtomicBool,
}

impl ConnectionMonitor {
    /// Create a disconnected monitor
    pub fn new() -> Self {
        Self {
            samples: RwLock::new(HashMap::new()),
            average_nanos: AtomicU64::new(DEFAULT_AVERAGE_LATENCY.as_nanos() as u64),
            connected: AtomicBool::new(false),
            initial_connect: AtomicBool::new(false),
        }
    }

    /// Create a monitor that already completed its first connection
    pub fn connected() -> Self {
        let monitor = Self::new();
        monitor.set_connected(true);
        monitor
    }

    /// Apply a connectivity change
    pub fn set_connected(&self, connected: bool) {
        let was = self.connected.swap(connected, Ordering::AcqRel);
        match (was, connected) {
            (false, true) => {
                if !self.initial_connect.swap(true, Ordering::AcqRel) {
                    info!("Backend initial connection succeeded");
                } else {
                    debug!("Backend connection restored");
                }
            }
            (true, false) => info!("Backend connection lost"),
            _ => {}
        }
    }

    /// The backend was closed for good
    pub fn closed(&self) {
        self.connected.store(false, Ordering::Release);
    }

    /// Record a round-trip sample for `server`. Ignored while disconnected.
    pub fn record_sample(&self, server: &str, round_trip: Duration) {
        if !self.is_connected() {
            return;
        }
        let mut samples = self.samples.write();
        samples.insert(server.to_string(), round_trip);
        let total: u128 = samples.values().map(Duration::as_nanos).sum();
        let average = total / samples.len() as u128;
        self.average_nanos
            .store(average.min(u64::MAX as u128) as u64, Ordering::Relaxed);
    }

    /// Mean round-trip time
    pub fn average_latency(&self) -> Duration {
        Duration::from_nanos(self.average_nanos.load(Ordering::Relaxed))
    }

    /// Current connectivity
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Whether the first connection ever succeeded
    pub fn initial_connect_succeeded(&self) -> bool {
        self.initial_connect.load(Ordering::Acquire)
    }

    /// Snapshot for readiness reporting
    pub fn health(&self) -> BackendHealth {
        BackendHealth {
            average_latency: self.average_latency(),
            connected: self.is_connected(),
            initial_connect_succeeded: self.initial_connect_succeeded(),
        }
    }
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}
