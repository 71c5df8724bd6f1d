use axum::Json;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

use crate::core::QueueError;

/// Errors surfaced to API callers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Endpoint requires valid json payload")]
    InvalidPayload,

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error("Job queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidPayload => StatusCode::NOT_ACCEPTABLE,
            Self::MissingField(_) => StatusCode::BAD_REQUEST,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::QueueUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::JobNotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidPayload => "invalid_payload",
            Self::MissingField(_) => "missing_field",
            Self::MethodNotAllowed => "method_not_allowed",
            Self::QueueUnavailable(_) => "queue_unavailable",
            Self::JobNotFound(_) => "not_found",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl From<QueueError> for ApiError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::Unavailable(reason) => Self::QueueUnavailable(reason),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let body = Json(json!({
            "error": self.code(),
            "message": self.to_string(),
        }));

        if matches!(self, Self::MethodNotAllowed) {
            (status, [(header::ALLOW, "POST")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}
