//! Error types for the tiered cache

use std::sync::Arc;

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the tiered cache
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Remote Tier Errors
    // =========================================================================
    /// Remote store unreachable or refused the command
    #[error("Remote tier unavailable: {0}")]
    RemoteUnavailable(String),

    /// Remote command exceeded the command timeout
    #[error("Remote tier operation '{operation}' timed out after {timeout_ms}ms")]
    RemoteTimeout { operation: String, timeout_ms: u64 },

    // =========================================================================
    // Serialization Errors
    // =========================================================================
    /// Value could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Stored payload envelope is malformed
    #[error("Corrupt payload for key {key}: {reason}")]
    CorruptPayload { key: String, reason: String },

    /// Compression failed
    #[error("Compression with {algorithm} failed: {reason}")]
    CompressionFailed { algorithm: String, reason: String },

    /// Decompression failed
    #[error("Decompression with {algorithm} failed: {reason}")]
    DecompressionFailed { algorithm: String, reason: String },

    // =========================================================================
    // Producer Errors
    // =========================================================================
    /// The producer behind a cache miss failed; shared by every deduplicated caller
    #[error("Producer failed: {0}")]
    Producer(Arc<anyhow::Error>),

    // =========================================================================
    // Configuration / Misuse Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Workload class name is not part of the strategy table
    #[error("Unknown workload class: {0}")]
    UnknownWorkloadClass(String),

    /// Key parameters cannot be canonicalized
    #[error("Unencodable parameters: {0}")]
    UnencodableParameters(String),

    /// Invalidation rule not found
    #[error("Invalidation rule not found: {0}")]
    RuleNotFound(String),

    /// Invalidation rule id already registered
    #[error("Invalidation rule already exists: {0}")]
    DuplicateRule(String),

    /// Alert not found
    #[error("Alert not found: {0}")]
    AlertNotFound(String),

    // =========================================================================
    // Maintenance Errors
    // =========================================================================
    /// A cleanup pass is already running
    #[error("Cleanup already in progress")]
    CleanupInProgress,

    /// A warming cycle is already running
    #[error("Cache warming already in progress")]
    WarmingInProgress,

    // =========================================================================
    // Metrics Errors
    // =========================================================================
    /// Prometheus registry or encoding error
    #[error("Metrics error: {0}")]
    Metrics(String),
}

impl Error {
    /// Whether the error means the remote tier could not be reached
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Error::RemoteUnavailable(_) | Error::RemoteTimeout { .. }
        )
    }

    /// Wrap a producer failure so it can be shared between waiters
    pub fn producer(err: anyhow::Error) -> Self {
        Error::Producer(Arc::new(err))
    }
}

impl From<redis::RedisError> for Error {
    fn from(e: redis::RedisError) -> Self {
        Error::RemoteUnavailable(e.to_string())
    }
}

impl From<prometheus::Error> for Error {
    fn from(e: prometheus::Error) -> Self {
        Error::Metrics(e.to_string())
    }
}

impl Clone for Error {
    fn clone(&self) -> Self {
        match self {
            Error::Io(e) => Error::Io(std::io::Error::new(e.kind(), e.to_string())),
            Error::Internal(s) => Error::Internal(s.clone()),
            Error::RemoteUnavailable(s) => Error::RemoteUnavailable(s.clone()),
            Error::RemoteTimeout {
                operation,
                timeout_ms,
            } => Error::RemoteTimeout {
                operation: operation.clone(),
                timeout_ms: *timeout_ms,
            },
            Error::Serialization(e) => Error::Internal(format!("serialization: {}", e)),
            Error::CorruptPayload { key, reason } => Error::CorruptPayload {
                key: key.clone(),
                reason: reason.clone(),
            },
            Error::CompressionFailed { algorithm, reason } => Error::CompressionFailed {
                algorithm: algorithm.clone(),
                reason: reason.clone(),
            },
            Error::DecompressionFailed { algorithm, reason } => Error::DecompressionFailed {
                algorithm: algorithm.clone(),
                reason: reason.clone(),
            },
            Error::Producer(e) => Error::Producer(Arc::clone(e)),
            Error::Config(s) => Error::Config(s.clone()),
            Error::UnknownWorkloadClass(s) => Error::UnknownWorkloadClass(s.clone()),
            Error::UnencodableParameters(s) => Error::UnencodableParameters(s.clone()),
            Error::RuleNotFound(s) => Error::RuleNotFound(s.clone()),
            Error::DuplicateRule(s) => Error::DuplicateRule(s.clone()),
            Error::AlertNotFound(s) => Error::AlertNotFound(s.clone()),
            Error::CleanupInProgress => Error::CleanupInProgress,
            Error::WarmingInProgress => Error::WarmingInProgress,
            Error::Metrics(s) => Error::Metrics(s.clone()),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
