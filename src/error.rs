//! Error types for the image cache tier

use std::time::Duration;

use hyper::StatusCode;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the image cache tier
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Metadata database error
    #[error("Metadata store error: {0}")]
    Database(#[from] rusqlite::Error),

    // =========================================================================
    // Durable Store Errors
    // =========================================================================
    /// Durable store rejected or failed an operation
    #[error("Durable store error for key {key}: {reason}")]
    DurableStore { key: String, reason: String },

    /// Durable store call exceeded the request timeout
    #[error("Durable store call for key {key} timed out after {timeout:?}")]
    DurableTimeout { key: String, timeout: Duration },

    // =========================================================================
    // Image Errors
    // =========================================================================
    /// Bytes could not be decoded as an image
    #[error("Image decode failed: {0}")]
    ImageDecode(String),

    /// Resize or re-encode failed
    #[error("Image processing failed for {image_id}: {reason}")]
    Transform { image_id: String, reason: String },

    /// Malformed read request parameters
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Image id is unknown or every source tier missed
    #[error("Image not found: {0}")]
    NotFound(String),

    // =========================================================================
    // Upload Errors
    // =========================================================================
    /// Malformed upload request
    #[error("Invalid upload: {0}")]
    InvalidUpload(String),

    /// Content-Type the upload endpoint does not accept
    #[error("Unsupported Content-Type: {0}")]
    UnsupportedContentType(String),

    /// Every item of an upload batch was rejected
    #[error("No valid images in upload batch ({rejected} rejected)")]
    EmptyBatch { rejected: usize },

    // =========================================================================
    // Runtime Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status surfaced to callers for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::InvalidUpload(_)
            | Error::InvalidRequest(_)
            | Error::EmptyBatch { .. }
            | Error::ImageDecode(_) => StatusCode::BAD_REQUEST,
            Error::UnsupportedContentType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the failure is transient and worth retrying on a later tick
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::Database(_) | Error::DurableStore { .. } | Error::DurableTimeout { .. }
        )
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(e: tokio::task::JoinError) -> Self {
        Error::Internal(format!("background task failed: {}", e))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_errors_map_to_client_status() {
        assert_eq!(
            Error::InvalidUpload("no files".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::EmptyBatch { rejected: 3 }.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::UnsupportedContentType("text/plain".into()).status_code(),
            StatusCode::UNSUPPORTED_MEDIA_TYPE
        );
    }

    #[test]
    fn test_not_found_and_processing_errors() {
        assert_eq!(
            Error::NotFound("abc".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        let err = Error::Transform {
            image_id: "abc".into(),
            reason: "truncated".into(),
        };
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.is_transient());
    }

    #[test]
    fn test_transient_classification() {
        let err = Error::DurableTimeout {
            key: "abc".into(),
            timeout: Duration::from_secs(5),
        };
        assert!(err.is_transient());
        assert!(err.to_string().contains("timed out"));
        assert!(Error::Io(std::io::Error::other("disk full")).is_transient());
    }
}
