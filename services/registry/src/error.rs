//! Error types for the registry

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::store::StoreError;

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Error types for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Generic missing resource (container, tag, image, user ...)
    #[error("not found: {0}")]
    NotFound(String),

    /// Blob not found
    #[error("blob not found: {0}")]
    BlobNotFound(String),

    /// Manifest not found
    #[error("manifest not found: {0}")]
    ManifestNotFound(String),

    /// Upload session not found
    #[error("upload not found: {0}")]
    UploadNotFound(String),

    /// The caller is anonymous but the operation needs an identity
    #[error("authentication required")]
    Unauthorized,

    /// The access policy denied the operation
    #[error("access denied: {0}")]
    Forbidden(String),

    /// A unique constraint rejected a create
    #[error("already exists: {0}")]
    PreconditionFailed(String),

    /// Finalizing the blob would meet or exceed the owner's quota
    #[error("quota exceeded: {used} bytes used, {additional} more requested, quota is {quota}")]
    QuotaExceeded {
        /// Bytes currently in use
        used: u64,
        /// Bytes the finalize would add
        additional: u64,
        /// Configured quota
        quota: u64,
    },

    /// Digest mismatch
    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch {
        /// Expected digest
        expected: String,
        /// Actual digest
        actual: String,
    },

    /// Size mismatch
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Announced size
        expected: u64,
        /// Received size
        actual: u64,
    },

    /// The operation is not valid for the current upload or image state
    #[error("not acceptable: {0}")]
    NotAcceptable(String),

    /// Invalid digest format
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// Invalid entity, collection, container or tag name
    #[error("invalid name: {0}")]
    InvalidName(String),

    /// Invalid manifest
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),

    /// Malformed request payload
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Unsupported manifest media type
    #[error("unsupported manifest type: {0}")]
    UnsupportedManifestType(String),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(#[from] storage::StorageError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected internal condition
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for RegistryError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotFound(what) => RegistryError::NotFound(what),
            StoreError::Conflict(what) => RegistryError::PreconditionFailed(what),
        }
    }
}

impl RegistryError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::NotFound(_)
            | RegistryError::BlobNotFound(_)
            | RegistryError::ManifestNotFound(_)
            | RegistryError::UploadNotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::Unauthorized => StatusCode::UNAUTHORIZED,
            RegistryError::Forbidden(_) => StatusCode::FORBIDDEN,
            RegistryError::PreconditionFailed(_) => StatusCode::PRECONDITION_FAILED,
            RegistryError::QuotaExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            RegistryError::DigestMismatch { .. } | RegistryError::SizeMismatch { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            RegistryError::NotAcceptable(_) => StatusCode::NOT_ACCEPTABLE,
            RegistryError::InvalidDigest(_)
            | RegistryError::InvalidName(_)
            | RegistryError::InvalidManifest(_)
            | RegistryError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            RegistryError::UnsupportedManifestType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            RegistryError::Storage(_) | RegistryError::Io(_) | RegistryError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Get the error code for OCI error responses
    pub fn error_code(&self) -> &'static str {
        match self {
            RegistryError::NotFound(_) => "NAME_UNKNOWN",
            RegistryError::BlobNotFound(_) => "BLOB_UNKNOWN",
            RegistryError::ManifestNotFound(_) => "MANIFEST_UNKNOWN",
            RegistryError::UploadNotFound(_) => "BLOB_UPLOAD_UNKNOWN",
            RegistryError::Unauthorized => "UNAUTHORIZED",
            RegistryError::Forbidden(_) => "DENIED",
            RegistryError::PreconditionFailed(_) => "CONFLICT",
            RegistryError::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            RegistryError::DigestMismatch { .. } | RegistryError::InvalidDigest(_) => {
                "DIGEST_INVALID"
            }
            RegistryError::SizeMismatch { .. } => "SIZE_INVALID",
            RegistryError::NotAcceptable(_) => "BLOB_UPLOAD_INVALID",
            RegistryError::InvalidName(_) => "NAME_INVALID",
            RegistryError::InvalidManifest(_) | RegistryError::UnsupportedManifestType(_) => {
                "MANIFEST_INVALID"
            }
            RegistryError::InvalidRequest(_) => "UNSUPPORTED",
            RegistryError::Storage(_) | RegistryError::Io(_) | RegistryError::Internal(_) => {
                "UNKNOWN"
            }
        }
    }

    fn is_internal(&self) -> bool {
        self.status_code() == StatusCode::INTERNAL_SERVER_ERROR
    }
}

/// OCI error response format
#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.error_code();

        // Internal errors carry filesystem paths; log them, never return them.
        let message = if self.is_internal() {
            tracing::error!(error = %self, "internal registry error");
            if let RegistryError::Storage(storage) = &self {
                tracing::debug!(span_trace = %storage.span_trace(), "storage error context");
            }
            "internal error".to_string()
        } else {
            self.to_string()
        };

        let body = ErrorResponse {
            errors: vec![ErrorDetail { code, message }],
        };

        (status, axum::Json(body)).into_response()
    }
}
