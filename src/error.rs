//! Error types for ratelim.

use thiserror::Error;

/// Main error type for ratelim operations.
#[derive(Error, Debug)]
pub enum RatelimError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The admission wait was cancelled before a token became available.
    /// Nothing was forwarded and no bucket state changed.
    #[error("Admission cancelled for key {key}")]
    Cancelled {
        /// Key of the limiter that was being waited on
        key: String,
    },

    /// Errors returned by the underlying transport, passed through as-is
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RatelimError {
    /// Whether this error is an admission cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RatelimError::Cancelled { .. })
    }
}

impl From<config::ConfigError> for RatelimError {
    fn from(err: config::ConfigError) -> Self {
        RatelimError::Config(err.to_string())
    }
}

/// Result type alias for ratelim operations.
pub type Result<T> = std::result::Result<T, RatelimError>;
