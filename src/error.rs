// Error handling module
// Defines error types for storage, credential refresh and request dispatch

use thiserror::Error;

/// Failures of the raw storage medium
#[derive(Error, Debug)]
pub enum StorageError {
    /// Medium is disabled or inaccessible
    #[error("Storage is unavailable")]
    Unavailable,

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome of a failed refresh attempt, broadcast to every waiter
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RefreshError {
    /// No valid refresh token is cached
    #[error("No refresh token available")]
    MissingRefreshToken,

    /// Transport failure reaching the refresh endpoint
    #[error("Refresh request failed: {0}")]
    Network(String),

    /// Backend answered with a non-OK result code
    #[error("Token refresh rejected: {code} - {message}")]
    Rejected { code: i64, message: String },

    /// Backend answered OK without a usable payload
    #[error("Invalid refresh response: {0}")]
    InvalidPayload(String),

    /// Refresh token itself was rejected; the session is over
    #[error("Session is no longer valid")]
    SessionInvalid,

    /// The exchange task went away before the refresh settled
    #[error("Refresh attempt was abandoned")]
    Abandoned,
}

impl RefreshError {
    /// Whether this failure ends the session
    pub fn is_terminal(&self) -> bool {
        matches!(self, RefreshError::SessionInvalid)
    }
}

/// Errors surfaced to callers of the session client
#[derive(Error, Debug)]
pub enum ClientError {
    /// Transport failure of the caller's own request
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;
