//! Error types for linewire-client.

use thiserror::Error;

/// Main error type for all session operations.
///
/// Every `send` resolves with either the response bytes or exactly one of
/// these variants.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The deadline elapsed before the operation resolved.
    #[error("Operation timed out")]
    Timeout,

    /// The operation was cancelled, either by the caller or by the transport.
    #[error("Operation cancelled")]
    Cancelled,

    /// Transport-level failure (resolve, connect, write or read).
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] std::io::Error),

    /// A second `send` while one is in flight, or the session is gone.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Rejected configuration value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// JSON error while loading a configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SessionError {
    /// Whether this error came from the transport rather than the session.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, SessionError::ConnectionFailed(_))
    }
}

/// Result type alias using SessionError.
pub type Result<T> = std::result::Result<T, SessionError>;
