//! Error types for tollgate.

use thiserror::Error;

/// Main error type for tollgate operations.
///
/// A denied request is not an error; only configuration and store failures
/// surface here.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Non-positive capacity, negative refill rate or non-positive weight
    #[error("Invalid rate limit configuration: {0}")]
    InvalidConfig(String),

    /// Remote connectivity, protocol or timeout failure
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Retry budget exhausted for a single key
    #[error("Store contention on key {key} after {attempts} attempts")]
    Contention { key: String, attempts: u32 },

    /// Service configuration could not be loaded
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TollgateError {
    /// Whether a caller may retry the operation with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TollgateError::StoreUnavailable(_) | TollgateError::Contention { .. }
        )
    }
}

impl From<::config::ConfigError> for TollgateError {
    fn from(e: ::config::ConfigError) -> Self {
        TollgateError::Config(e.to_string())
    }
}

/// Result type alias for tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
