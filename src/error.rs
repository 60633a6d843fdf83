//! Error types for the Outpost gateway

use std::time::Duration;

use thiserror::Error;

use crate::correlator::RequestKind;

/// Result type alias for Outpost operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the Outpost gateway
#[derive(Debug, Error)]
pub enum Error {
    /// A required field was missing or malformed; nothing was written
    #[error("validation error: {0}")]
    Validation(String),

    /// The shared store could not be reached or written
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// No matching response arrived inside the wait window
    #[error("device {device_id} did not answer {kind} within {}ms", elapsed.as_millis())]
    TimedOut {
        device_id: String,
        kind: RequestKind,
        elapsed: Duration,
    },

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
