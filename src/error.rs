//! Error types for the scan store.
//!
//! Uses `thiserror` for ergonomic error definitions.

use thiserror::Error;

/// Main error type for storage operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The configured backend name is not one of the known backends.
    /// Fatal; callers must not retry.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// The backing store could not be reached. Callers retry with backoff;
    /// this layer never retries internally.
    #[error("Connection failed: {0}")]
    Connection(String),

    /// A uniqueness constraint rejected a create. The losing caller of a
    /// create race re-reads and proceeds.
    #[error("Uniqueness constraint violated: {0}")]
    ConstraintViolation(String),

    /// A write referenced a Site or Scan that does not exist. Read paths
    /// return `None` instead of this error.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed input to an operation (negative counts, illegal state
    /// transition, missing error message on a failed result).
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A stored blob or driver value could not be decoded into the
    /// normalized record shape.
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Relational backend error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Graph backend error: {0}")]
    Neo4j(#[from] neo4rs::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for storage operations.
pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    /// Whether the caller may retry the failed operation as-is.
    ///
    /// Constraint violations are retried by re-reading; connection failures
    /// by backing off. Configuration and validation errors are final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::ConstraintViolation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(StoreError::Connection("refused".into()).is_retryable());
        assert!(StoreError::ConstraintViolation("sites.domain".into()).is_retryable());
        assert!(!StoreError::Configuration("bad backend".into()).is_retryable());
        assert!(!StoreError::Validation("negative counts".into()).is_retryable());
        assert!(!StoreError::NotFound("site 7".into()).is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = StoreError::NotFound("scan 42".into());
        assert_eq!(err.to_string(), "Not found: scan 42");
    }
}
