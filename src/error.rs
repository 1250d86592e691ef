//! Unified error handling for tracksync operations.
//!
//! The taxonomy mirrors the fetch pipeline: transport failure, non-success
//! HTTP status, unparsable body. Listener failures never surface here; they
//! are caught and logged at the notification site.

use thiserror::Error;

/// Unified error type for synchronization operations.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// Transport-level failure reaching a resource (includes timeouts).
    #[error("network error for '{path}': {message}")]
    Network { path: String, message: String },

    /// Resource responded with a non-success HTTP status.
    #[error("HTTP {status} for '{path}'")]
    Http { path: String, status: u16 },

    /// Resource body was not valid JSON in any supported mode.
    #[error("parse error for '{path}': {message}")]
    Parse { path: String, message: String },
}

impl SyncError {
    /// Path of the resource the error refers to.
    pub fn path(&self) -> &str {
        match self {
            SyncError::Network { path, .. }
            | SyncError::Http { path, .. }
            | SyncError::Parse { path, .. } => path,
        }
    }
}

/// Result type alias for tracksync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
