//! Error types for the fanout bus.

use thiserror::Error;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, RealtimeError>;

/// Errors that can occur on the fanout bus.
#[derive(Debug, Error)]
pub enum RealtimeError {
    /// No connection registered under the given id.
    #[error("Connection not found: {0}")]
    ConnectionNotFound(String),

    /// Transport-level send failure; the connection is dropped.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Inbound frame could not be parsed into a typed message.
    #[error("Malformed message: {0}")]
    Parse(String),
}

impl From<serde_json::Error> for RealtimeError {
    fn from(err: serde_json::Error) -> Self {
        RealtimeError::Parse(err.to_string())
    }
}
