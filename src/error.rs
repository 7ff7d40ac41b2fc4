//! Error types for the Hermes orchestration core
//!
//! This module provides comprehensive error handling using thiserror for
//! structured error definitions and anyhow for error propagation. Errors
//! are grouped by operational kind rather than by origin so that retry
//! and admission policies can be decided from the variant alone.

use thiserror::Error;

/// Main error type for Hermes operations
#[derive(Error, Debug)]
pub enum HermesError {
    /// Transient provider failure (network, timeout, 5xx, rate-limited)
    #[error("Provider error: {0}")]
    Provider(String),

    /// Terminal configuration problem (missing key, unknown provider/worker)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Malformed provider response
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Breaker open, rate limit exceeded, or admission gate blocked
    #[error("Resource refused: {0}")]
    ResourceRefused(String),

    /// Disk write failure in the persistent store
    #[error("Storage error: {0}")]
    Storage(String),

    /// Operation cancelled by user or shutdown
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Internal data model inconsistency, fatal to the affected component
    #[error("Invariant violation: {0}")]
    Invariant(String),

    /// Request or entry not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid identifier format
    #[error("Invalid id: {0}")]
    InvalidId(#[from] uuid::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl HermesError {
    /// Whether the retry-with-backoff policy applies to this error
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HermesError::Provider(_) | HermesError::ResourceRefused(_)
        ) || matches!(self, HermesError::Http(e) if e.is_timeout() || e.is_connect())
    }
}

/// Result type alias for Hermes operations
pub type Result<T> = std::result::Result<T, HermesError>;

/// Convert anyhow::Error to HermesError
impl From<anyhow::Error> for HermesError {
    fn from(err: anyhow::Error) -> Self {
        HermesError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HermesError::NotFound("req-42".to_string());
        assert_eq!(err.to_string(), "Not found: req-42");
    }

    #[test]
    fn test_transient_classification() {
        assert!(HermesError::Provider("503".to_string()).is_transient());
        assert!(HermesError::ResourceRefused("rate limited".to_string()).is_transient());
        assert!(!HermesError::Configuration("no api key".to_string()).is_transient());
        assert!(!HermesError::Cancelled("shutdown".to_string()).is_transient());
    }

    #[test]
    fn test_error_conversion() {
        let uuid_err = uuid::Uuid::parse_str("invalid");
        assert!(uuid_err.is_err());

        let hermes_err: HermesError = uuid_err.unwrap_err().into();
        assert!(matches!(hermes_err, HermesError::InvalidId(_)));
    }
}
