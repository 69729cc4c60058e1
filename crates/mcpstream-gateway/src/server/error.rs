//! HTTP error mapping

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use mcpstream_core::{ArtifactError, PublishError};
use serde::Serialize;
use thiserror::Error;

use crate::auth::AuthError;
use crate::error::{CapacityError, StreamError};

/// Error returned by HTTP handlers
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Artifact(#[from] ArtifactError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling
    pub code: String,
    pub message: String,
    /// Offending field, for validation errors
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

fn auth_status(err: &AuthError) -> (StatusCode, &'static str) {
    match err {
        AuthError::InsufficientScope { .. } => (StatusCode::FORBIDDEN, "forbidden"),
        _ => (StatusCode::UNAUTHORIZED, "unauthorized"),
    }
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Auth(e) => auth_status(e),
            ApiError::Stream(e) => match e {
                StreamError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
                StreamError::Authorization(e) => auth_status(e),
                StreamError::Capacity(CapacityError::LimitReached { .. }) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "capacity_exceeded")
                }
                StreamError::Capacity(CapacityError::DuplicateContext { .. }) => {
                    (StatusCode::CONFLICT, "duplicate_connection")
                }
                StreamError::Transport(_) => (StatusCode::BAD_GATEWAY, "transport_error"),
                StreamError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "invalid_request"),
            },
            ApiError::Publish(e) => match e {
                PublishError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
                PublishError::Inactive { .. } => (StatusCode::CONFLICT, "context_closed"),
            },
            ApiError::Artifact(e) => match e {
                ArtifactError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                ArtifactError::TooLarge { .. } => (StatusCode::PAYLOAD_TOO_LARGE, "too_large"),
                ArtifactError::Empty => (StatusCode::BAD_REQUEST, "empty_artifact"),
                ArtifactError::MimeTypeNotAllowed(_) => {
                    (StatusCode::UNSUPPORTED_MEDIA_TYPE, "mime_type_not_allowed")
                }
                ArtifactError::Expired => (StatusCode::GONE, "url_expired"),
                ArtifactError::TtlOutOfRange(_) => (StatusCode::BAD_REQUEST, "invalid_ttl"),
                ArtifactError::InvalidSignature => (StatusCode::FORBIDDEN, "invalid_signature"),
                ArtifactError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "storage_error"),
            },
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "conflict"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
        }
    }

    fn field(&self) -> Option<String> {
        match self {
            ApiError::Stream(StreamError::Validation(e))
            | ApiError::Publish(PublishError::Validation(e)) => Some(e.field.clone()),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(status = %status, code, error = %message, "[Gateway] Server error");
        } else {
            tracing::warn!(status = %status, code, error = %message, "[Gateway] Client error");
        }

        let body = ErrorResponse {
            code: code.to_string(),
            message,
            field: self.field(),
        };
        (status, Json(body)).into_response()
    }
}
