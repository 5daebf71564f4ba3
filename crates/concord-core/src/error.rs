//! Error types for concord.

use thiserror::Error;

/// Result type alias using concord's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for entity resolution operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Key-value cache operation failed
    #[error("Cache error: {0}")]
    Cache(String),

    /// Backing store cannot be reached (non-sqlx stores)
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Concept not found
    #[error("Concept not found: {0}")]
    ConceptNotFound(uuid::Uuid),

    /// Embedding generation or vector lookup failed
    #[error("Embedding error: {0}")]
    Embedding(String),

    /// Inference/generation failed
    #[error("Inference error: {0}")]
    Inference(String),

    /// Cross-encoder scoring failed
    #[error("Cross-encoder error: {0}")]
    CrossEncoder(String),

    /// Candidate generation could not reach its indices
    #[error("Blocking error: {0}")]
    Blocking(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation refused because a precondition on stored state does not hold
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// External call exceeded its time budget
    #[error("Timed out: {0}")]
    Timeout(String),

    /// HTTP/network request failed
    #[error("Request error: {0}")]
    Request(String),

    /// Run was cancelled by its caller
    #[error("Cancelled")]
    Cancelled,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Errors that callers may recover from locally with degraded behavior.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Cache(_)
                | Error::Embedding(_)
                | Error::Inference(_)
                | Error::CrossEncoder(_)
                | Error::Timeout(_)
                | Error::Request(_)
        )
    }

    /// Whether the error means the backing store cannot be reached at all.
    ///
    /// A run that hits this stops instead of recording per-pair failures.
    pub fn is_store_unreachable(&self) -> bool {
        match self {
            Error::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::Tls(_)
            ),
            Error::Unavailable(_) => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else {
            Error::Request(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_error_display_not_found() {
        let err = Error::NotFound("merge proposal".to_string());
        assert_eq!(err.to_string(), "Not found: merge proposal");
    }

    #[test]
    fn test_error_display_concept_not_found() {
        let id = Uuid::nil();
        let err = Error::ConceptNotFound(id);
        assert_eq!(err.to_string(), format!("Concept not found: {}", id));
    }

    #[test]
    fn test_error_display_invalid_state() {
        let err = Error::InvalidState("survivor merged again".to_string());
        assert_eq!(err.to_string(), "Invalid state: survivor merged again");
    }

    #[test]
    fn test_error_display_cancelled() {
        assert_eq!(Error::Cancelled.to_string(), "Cancelled");
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::Cache("down".into()).is_transient());
        assert!(Error::Timeout("embed".into()).is_transient());
        assert!(Error::CrossEncoder("503".into()).is_transient());
        assert!(!Error::InvalidState("x".into()).is_transient());
        assert!(!Error::Cancelled.is_transient());
    }

    #[test]
    fn test_store_unreachable_classification() {
        assert!(Error::Database(sqlx::Error::PoolTimedOut).is_store_unreachable());
        assert!(Error::Database(sqlx::Error::PoolClosed).is_store_unreachable());
        assert!(!Error::Database(sqlx::Error::RowNotFound).is_store_unreachable());
        assert!(!Error::Cache("down".into()).is_store_unreachable());
    }

    #[test]
    fn test_from_serde_json_error() {
        let json_err = serde_json::from_str::<i32>("not a number").unwrap_err();
        let err: Error = json_err.into();
        match err {
            Error::Serialization(msg) => assert!(!msg.is_empty()),
            _ => panic!("Expected Serialization error"),
        }
    }

    #[test]
    fn test_error_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<Error>();
        assert_sync::<Error>();
    }
}
