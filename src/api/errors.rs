//! API error types

use thiserror::Error;

use crate::storage::SecretError;

/// Errors that can occur when communicating with the controller
#[derive(Debug, Error)]
pub enum ApiError {
    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Failed to parse JSON response
    #[error("Failed to parse response: {0}")]
    Parse(#[from] serde_json::Error),

    /// Controller returned a non-2xx response
    #[error("Controller error ({status}): {message}")]
    Server { status: u16, message: String },

    /// Request timed out
    #[error("Request timed out")]
    Timeout,

    /// All retry attempts exhausted
    #[error("All retry attempts exhausted: {0}")]
    RetryExhausted(String),

    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// The agent has not completed registration
    #[error("Agent has not been initialized")]
    NotInitialized,

    /// Keystore failure while reading or persisting the secret
    #[error(transparent)]
    Secret(#[from] SecretError),
}

impl ApiError {
    /// Check if this error is retryable.
    ///
    /// Any transport failure or non-2xx status is retried; local failures
    /// (keystore, parsing a 2xx body) are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::Request(_) | ApiError::Server { .. } | ApiError::Timeout
        )
    }
}

/// Result type for API operations
pub type ApiResult<T> = Result<T, ApiError>;
