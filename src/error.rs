//! Error types for the tiered entity cache

use std::time::Duration;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the tiered entity cache
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Cache Operation Errors
    // =========================================================================
    /// Update or delete target is absent
    #[error("Entity not found in cache {cache}: {key}")]
    NotFound { cache: String, key: String },

    /// Create on an id that is already persisted
    #[error("Duplicate key in cache {cache}: {key}")]
    DuplicateKey { cache: String, key: String },

    /// Write would give a unique index value a second owner
    #[error("Unique index {index} in cache {cache} already maps {value} to {owner}")]
    UniqueViolation {
        cache: String,
        index: String,
        value: String,
        owner: String,
    },

    /// Every compare-and-swap attempt lost the race
    #[error("Update of {key} in cache {cache} failed after {attempts} attempts (last observed version {observed_version})")]
    RetryLimitExceeded {
        cache: String,
        key: String,
        attempts: u32,
        observed_version: i64,
    },

    /// Whole-operation deadline elapsed
    #[error("Operation on {key} in cache {cache} timed out after {after:?}")]
    Timeout {
        cache: String,
        key: String,
        after: Duration,
    },

    /// Misuse of the entity model (read-only write, unbound field, duplicate field name)
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    // =========================================================================
    // Backend Errors
    // =========================================================================
    /// Transport or session failure during a single attempt
    #[error("Transient backend error: {0}")]
    TransientBackend(String),

    /// Non-retryable backend failure
    #[error("Backend error: {0}")]
    Backend(String),

    /// Backend is not ready to serve cache traffic
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Document (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Key string could not be decoded
    #[error("Invalid key '{value}': {reason}")]
    KeyCodec { value: String, reason: String },

    // =========================================================================
    // Registry Errors
    // =========================================================================
    /// Cache name already registered
    #[error("Cache already registered: {0}")]
    DuplicateCache(String),

    /// Cache declares a dependency nobody registered
    #[error("Cache {cache} depends on unregistered cache {dependency}")]
    UnknownDependency { cache: String, dependency: String },

    /// Cache dependencies form a cycle
    #[error("Cache dependency cycle: {}", .0.join(" -> "))]
    DependencyCycle(Vec<String>),

    // =========================================================================
    // Runtime Errors
    // =========================================================================
    /// Blocking call issued from a thread driving an async runtime
    #[error("Blocking cache call issued from within an async runtime")]
    BlockingInAsyncContext,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Build an invariant violation from anything printable
    pub fn invariant(message: impl Into<String>) -> Self {
        Error::InvariantViolation(message.into())
    }

    /// Returns true if the error may be absorbed by the update retry loop
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientBackend(_))
    }

    /// Returns true if the error is a programmer error that must never be retried
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Error::InvariantViolation(_))
    }
}

// =============================================================================
// Tests
// =============================================================================
