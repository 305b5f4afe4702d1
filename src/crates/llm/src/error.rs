//! Error types for LLM provider clients.

use thiserror::Error;

/// Result type for LLM operations.
pub type Result<T> = std::result::Result<T, LlmError>;

/// Errors that can occur when working with LLM providers.
#[derive(Debug, Error)]
pub enum LlmError {
    /// API credential was rejected by the provider.
    #[error("Invalid credential: {0}")]
    InvalidCredential(String),

    /// Account quota exhausted; retrying will not help.
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Provider asked us to back off.
    #[error("Rate limited, retry after {retry_after}s")]
    RateLimited {
        /// Seconds to wait before the next attempt.
        retry_after: u64,
    },

    /// Provider returned a retryable 5xx status.
    #[error("Server error {status}")]
    ServerTransient {
        /// HTTP status code returned by the provider.
        status: u16,
    },

    /// Requested model is known but not currently serving.
    #[error("Model not ready: {model}")]
    NotReady {
        /// Model identifier.
        model: String,
    },

    /// Provider endpoint could not be reached.
    #[error("Provider unreachable: {0}")]
    Unreachable(String),

    /// Provider returned a payload we could not interpret.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Request rejected before it was sent.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Client-side configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl LlmError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LlmError::ServerTransient { .. }
                | LlmError::RateLimited { .. }
                | LlmError::Unreachable(_)
        )
    }

    /// Check if this error is due to authentication.
    pub fn is_auth_error(&self) -> bool {
        matches!(self, LlmError::InvalidCredential(_))
    }
}

impl From<reqwest::Error> for LlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            LlmError::Unreachable(err.to_string())
        } else {
            LlmError::InvalidResponse(err.to_string())
        }
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(err: serde_json::Error) -> Self {
        LlmError::InvalidResponse(err.to_string())
    }
}
