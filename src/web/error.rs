use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;

use crate::core::DispatchError;
use crate::error::OperationError;

const RESOURCE_NOT_FOUND: &str = "Resource not found";
const INTERNAL_ERROR: &str = "An internal error occurred, check the API logs";

/// An error answered to the HTTP caller as `{"error": "<message>"}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND, RESOURCE_NOT_FOUND)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<OperationError> for ApiError {
    fn from(err: OperationError) -> Self {
        match err {
            OperationError::ScopeConfig(_) | OperationError::BackupNotFound(_) => {
                Self::new(StatusCode::NOT_FOUND, err.to_string())
            }
            OperationError::NotFound { .. } | OperationError::OperationNotExists(_) => {
                Self::not_found()
            }
            OperationError::MalformedContent(detail) => Self::bad_request(format!(
                "Make sure all options/arguments are met and try again: {}",
                detail
            )),
            OperationError::UnsupportedScope { .. } | OperationError::InvalidId(_) => {
                Self::bad_request(err.to_string())
            }
            OperationError::AlreadyExists { .. } => Self::new(StatusCode::CONFLICT, err.to_string()),
            OperationError::Diagnose(_)
            | OperationError::NotADirectory(_)
            | OperationError::Io { .. }
            | OperationError::Parse { .. }
            | OperationError::Task(_) => {
                tracing::error!(error = %err, "Request failed");
                Self::new(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR)
            }
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::new(rejection.status(), rejection.body_text())
    }
}
