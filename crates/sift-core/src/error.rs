use std::time::Duration;

use thiserror::Error;

/// Default retry hint attached to storage failures when the caller does not
/// supply one.
pub const DEFAULT_RETRY_AFTER_MS: u64 = 250;

/// Reasons a single input item is rejected.
///
/// Validation failures are per-item: an ingestion batch keeps going after one
/// of these, and the store is left untouched for the rejected item.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("embedding is an all-zero vector")]
    EmptyVector,

    #[error("embedding component {index} is not finite")]
    NonFinite { index: usize },

    #[error("malformed identifier: {0}")]
    MalformedId(String),

    #[error("text is empty")]
    EmptyText,
}

/// Top-level error type for sift.
///
/// Storage and timeout failures are retryable and carry enough information
/// for the caller to back off; everything else is final for the request.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SiftError {
    #[error("Invalid input: {0}")]
    InvalidInput(#[from] ValidationError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Storage unavailable: {reason} (retry after {retry_after_ms} ms)")]
    StorageUnavailable { reason: String, retry_after_ms: u64 },

    #[error("Timed out during {operation}")]
    Timeout { operation: &'static str },

    #[error("Index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl SiftError {
    /// Storage failure with the default retry hint.
    pub fn storage(reason: impl Into<String>) -> Self {
        SiftError::StorageUnavailable {
            reason: reason.into(),
            retry_after_ms: DEFAULT_RETRY_AFTER_MS,
        }
    }

    /// Replace the retry hint on a storage failure; other errors pass through.
    pub fn with_retry_after(self, ms: u64) -> Self {
        match self {
            SiftError::StorageUnavailable { reason, .. } => SiftError::StorageUnavailable {
                reason,
                retry_after_ms: ms,
            },
            other => other,
        }
    }

    pub fn timeout(operation: &'static str) -> Self {
        SiftError::Timeout { operation }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SiftError::StorageUnavailable { .. } | SiftError::Timeout { .. }
        )
    }

    /// Suggested backoff before retrying, if the error is retryable.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SiftError::StorageUnavailable { retry_after_ms, .. } => {
                Some(Duration::from_millis(*retry_after_ms))
            }
            SiftError::Timeout { .. } => Some(Duration::from_millis(DEFAULT_RETRY_AFTER_MS)),
            _ => None,
        }
    }
}

impl From<toml::de::Error> for SiftError {
    fn from(err: toml::de::Error) -> Self {
        SiftError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for SiftError {
    fn from(err: toml::ser::Error) -> Self {
        SiftError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for SiftError {
    fn from(err: serde_json::Error) -> Self {
        SiftError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for sift operations.
pub type Result<T> = std::result::Result<T, SiftError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SiftError::Config("missing field".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing field");
    }

    #[test]
    fn test_validation_display() {
        let err: SiftError = ValidationError::DimensionMismatch {
            expected: 4,
            actual: 3,
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Invalid input: dimension mismatch: expected 4, got 3"
        );
        assert!(matches!(err, SiftError::InvalidInput(_)));
    }

    #[test]
    fn test_storage_error_is_retryable_with_hint() {
        let err = SiftError::storage("disk gone");
        assert!(err.is_retryable());
        assert_eq!(
            err.retry_after(),
            Some(Duration::from_millis(DEFAULT_RETRY_AFTER_MS))
        );
        assert!(err.to_string().contains("disk gone"));
    }

    #[test]
    fn test_with_retry_after_only_touches_storage_errors() {
        let err = SiftError::storage("down").with_retry_after(1_000);
        assert_eq!(err.retry_after(), Some(Duration::from_millis(1_000)));
        let err = SiftError::NotFound("x".into()).with_retry_after(1_000);
        assert!(matches!(err, SiftError::NotFound(_)));
    }

    #[test]
    fn test_timeout_is_retryable() {
        let err = SiftError::timeout("store.put");
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "Timed out during store.put");
    }

    #[test]
    fn test_application_errors_not_retryable() {
        let cases = vec![
            SiftError::InvalidInput(ValidationError::EmptyVector),
            SiftError::NotFound("a".into()),
            SiftError::IndexUnavailable("not built".into()),
            SiftError::Config("bad".into()),
            SiftError::Serialization("bad".into()),
            SiftError::Task("panicked".into()),
        ];
        for err in cases {
            assert!(!err.is_retryable(), "{err} should not be retryable");
            assert!(err.retry_after().is_none());
        }
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: SiftError = io_err.into();
        assert!(matches!(err, SiftError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_error_from_toml_de() {
        let err: std::result::Result<toml::Value, _> = toml::from_str("invalid = [[[");
        let err: SiftError = err.unwrap_err().into();
        assert!(matches!(err, SiftError::Config(_)));
    }

    #[test]
    fn test_error_from_serde_json() {
        let err: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope }");
        let err: SiftError = err.unwrap_err().into();
        assert!(matches!(err, SiftError::Serialization(_)));
    }
}
