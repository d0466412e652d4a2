//! Error types for the Quotagate engine.

use thiserror::Error;

/// Main error type for Quotagate operations.
#[derive(Error, Debug)]
pub enum QuotaGateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The counter store could not be reached or did not answer in time
    #[error("Counter store unavailable: {0}")]
    StoreUnavailable(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redis::RedisError> for QuotaGateError {
    fn from(err: redis::RedisError) -> Self {
        QuotaGateError::StoreUnavailable(err.to_string())
    }
}

impl From<config::ConfigError> for QuotaGateError {
    fn from(err: config::ConfigError) -> Self {
        QuotaGateError::Config(err.to_string())
    }
}

impl QuotaGateError {
    /// Whether this error means the counter store is unreachable.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, QuotaGateError::StoreUnavailable(_))
    }
}

/// Result type alias for Quotagate operations.
pub type Result<T> = std::result::Result<T, QuotaGateError>;
