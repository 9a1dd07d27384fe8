//! Common error types for SnapMatch.

use thiserror::Error;

/// Top-level error type for SnapMatch operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Missing or invalid configuration. Fatal at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Provider rejected our credentials.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Network or provider hiccup.
    #[error("Network error: {0}")]
    Network(String),

    /// Provider throttled the request.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Storage operation failed permanently.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Access to the resource was denied.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// A processing job could not be started.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// The external process could not be spawned or supervised.
    #[error("Process error: {0}")]
    Process(String),

    /// An operation exceeded its time budget.
    #[error("Timed out: {0}")]
    Timeout(String),
}

impl Error {
    /// Whether the error is a transient condition that may clear up on its own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Network(_) | Error::RateLimited(_) | Error::Timeout(_) | Error::Io(_)
        )
    }

    /// Whether the error means the object is absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Network("reset".to_string()).is_transient());
        assert!(Error::RateLimited("429".to_string()).is_transient());
        assert!(!Error::NotFound("x".to_string()).is_transient());
        assert!(!Error::Configuration("x".to_string()).is_transient());
    }

    #[test]
    fn test_display_includes_cause() {
        let err = Error::Precondition("no source photos".to_string());
        assert_eq!(err.to_string(), "Precondition failed: no source photos");
    }
}
