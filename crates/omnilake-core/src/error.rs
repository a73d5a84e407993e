//! Error types for OmniLake.

use thiserror::Error;

use crate::models::ArchiveStatus;

/// Result type alias using OmniLake's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for OmniLake operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Archive is not in a status compatible with the requested operation
    #[error("Archive {archive_id} is busy (status {status})")]
    ArchiveBusy {
        archive_id: String,
        status: ArchiveStatus,
    },

    /// Job ledger error
    #[error("Job error: {0}")]
    Job(String),

    /// A single lookup instruction failed
    #[error("Lookup error: {0}")]
    Lookup(String),

    /// The processing stage failed
    #[error("Processing error: {0}")]
    Processing(String),

    /// A `REF:` token could not be resolved
    #[error("Reference error: {0}")]
    Reference(String),

    /// Request or chain body rejected at submission
    #[error("Validation error: {0}")]
    Validation(String),

    /// Embedding generation failed
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Inference/generation failed
    #[error("Inference error: {0}")]
    Inference(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// File I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the caller may retry the same operation later.
    ///
    /// Archive maintenance and transport failures clear up on their own;
    /// everything else is deterministic.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ArchiveBusy { .. } | Error::Request(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Request(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_not_found() {
        let err = Error::NotFound("lake request abc".to_string());
        assert_eq!(err.to_string(), "Not found: lake request abc");
    }

    #[test]
    fn test_error_display_archive_busy() {
        let err = Error::ArchiveBusy {
            archive_id: "research".to_string(),
            status: ArchiveStatus::Maintenance,
        };
        assert_eq!(
            err.to_string(),
            "Archive research is busy (status MAINTENANCE)"
        );
    }

    #[test]
    fn test_error_display_reference() {
        let err = Error::Reference("step 'a' has not executed".to_string());
        assert_eq!(
            err.to_string(),
            "Reference error: step 'a' has not executed"
        );
    }

    #[test]
    fn test_error_display_validation() {
        let err = Error::Validation("duplicate step name 'a'".to_string());
        assert_eq!(
            err.to_string(),
            "Validation error: duplicate step name 'a'"
        );
    }

    #[test]
    fn test_error_display_processing() {
        let err = Error::Processing("model unavailable".to_string());
        assert_eq!(err.to_string(), "Processing error: model unavailable");
    }

    #[test]
    fn test_archive_busy_is_retryable() {
        let err = Error::ArchiveBusy {
            archive_id: "a".to_string(),
            status: ArchiveStatus::Maintenance,
        };
        assert!(err.is_retryable());
        assert!(Error::Request("connection reset".into()).is_retryable());
    }

    #[test]
    fn test_deterministic_errors_not_retryable() {
        assert!(!Error::Validation("bad".into()).is_retryable());
        assert!(!Error::NotFound("x".into()).is_retryable());
        assert!(!Error::Processing("x".into()).is_retryable());
        assert!(!Error::Lookup("x".into()).is_retryable());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io_err.into();
        assert!(err.to_string().starts_with("I/O error"));
    }
}
