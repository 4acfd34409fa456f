//! Error types for the reconciliation service

use axum::http::StatusCode;
use thiserror::Error;

/// Result type alias for reconciliation operations
pub type Result<T> = std::result::Result<T, ReconciliationError>;

#[derive(Error, Debug)]
pub enum ReconciliationError {

    // =============================
    // Caller-facing Errors
    // =============================

    #[error("{0}")]
    InvalidInput(String),

    #[error("Batch not found: {0}")]
    BatchNotFound(i64),

    #[error("Unsupported file type: {0}")]
    UnsupportedMediaType(String),

    // =============================
    // Collaborator Errors
    // =============================

    #[error("Text extraction error: {0}")]
    TextExtraction(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Collaborator timed out after {0}s")]
    Timeout(u64),

    // =============================
    // Infrastructure Errors
    // =============================

    #[error("Database error: {0}")]
    Database(String),

    #[error("Audit error: {0}")]
    Audit(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReconciliationError {
    /// HTTP status the request layer reports for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::BatchNotFound(_) => StatusCode::NOT_FOUND,
            Self::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to hand back to a client. Internal failures stay in the log.
    pub fn public_message(&self) -> String {
        match self {
            Self::InvalidInput(msg) => msg.clone(),
            Self::BatchNotFound(_) => "Batch not found.".to_string(),
            Self::UnsupportedMediaType(mime) => format!("Unsupported file type: {}", mime),
            _ => "An unexpected error occurred.".to_string(),
        }
    }

    pub(crate) fn database(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Database(format!("{}: {}", context, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ReconciliationError::InvalidInput("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ReconciliationError::BatchNotFound(7).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ReconciliationError::Database("boom".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_internal_detail_not_exposed() {
        let err = ReconciliationError::Database("password authentication failed".into());
        assert_eq!(err.public_message(), "An unexpected error occurred.");
    }
}
