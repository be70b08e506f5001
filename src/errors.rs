use crate::services::{
    file_service::FileServiceError,
    ingestion::IngestError,
    metadata_store::MetadataError,
    object_store::ObjectStoreError,
    retrieval::{RangeError, RetrievalError},
    upload_sessions::SessionError,
};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = self.status.as_u16(), "{}", self.message);
        }
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<ObjectStoreError> for AppError {
    fn from(err: ObjectStoreError) -> Self {
        let status = match &err {
            ObjectStoreError::InvalidBucketName { .. } | ObjectStoreError::InvalidObjectKey => {
                StatusCode::BAD_REQUEST
            }
            ObjectStoreError::BucketNotFound(_) | ObjectStoreError::ObjectNotFound { .. } => {
                StatusCode::NOT_FOUND
            }
            ObjectStoreError::LengthMismatch { .. }
            | ObjectStoreError::Sidecar(_)
            | ObjectStoreError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, err.to_string())
    }
}

impl From<MetadataError> for AppError {
    fn from(err: MetadataError) -> Self {
        let status = match &err {
            MetadataError::NotFound(_) => StatusCode::NOT_FOUND,
            MetadataError::Duplicate { .. } => StatusCode::CONFLICT,
            MetadataError::Sqlx(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, err.to_string())
    }
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        let status = match &err {
            SessionError::InvalidSession(_)
            | SessionError::InvalidChunk(_)
            | SessionError::MissingChunk { .. } => StatusCode::BAD_REQUEST,
            SessionError::AlreadyMerging(_) => StatusCode::CONFLICT,
            SessionError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, err.to_string())
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::UnsupportedArchive(_) => AppError::bad_request(err.to_string()),
            IngestError::Bucket { source, .. } => source.into(),
            IngestError::Extraction(_) | IngestError::Io(_) => AppError::internal(err.to_string()),
        }
    }
}

impl From<RangeError> for AppError {
    fn from(err: RangeError) -> Self {
        AppError::new(StatusCode::RANGE_NOT_SATISFIABLE, err.to_string())
    }
}

impl From<RetrievalError> for AppError {
    fn from(err: RetrievalError) -> Self {
        match err {
            RetrievalError::NotFound(_) => AppError::not_found(err.to_string()),
            RetrievalError::Gone(_) => AppError::new(StatusCode::GONE, err.to_string()),
            RetrievalError::Range(range) => range.into(),
            RetrievalError::Metadata(inner) => inner.into(),
            RetrievalError::Store(inner) => inner.into(),
        }
    }
}

impl From<FileServiceError> for AppError {
    fn from(err: FileServiceError) -> Self {
        match err {
            FileServiceError::Store(inner) => inner.into(),
            FileServiceError::Metadata(inner) => inner.into(),
            FileServiceError::Session(inner) => inner.into(),
            FileServiceError::Ingest(inner) => inner.into(),
            FileServiceError::Retrieval(inner) => inner.into(),
            FileServiceError::Io(inner) => AppError::internal(inner.to_string()),
        }
    }
}
