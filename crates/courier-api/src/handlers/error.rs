//! JSON error responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use courier_core::CoreError;
use courier_dispatch::DispatchError;
use serde::Serialize;
use tracing::error;

/// Error response with code and message.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error details including code and message
    pub error: ErrorDetail,
}

/// Detailed error information.
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    /// Stable machine-readable code, e.g. `queue_closed`
    pub code: String,
    /// Human-readable error description
    pub message: String,
}

/// Failure of an API request.
#[derive(Debug)]
pub enum ApiError {
    /// Error raised by the queue facade or store.
    Dispatch(DispatchError),
    /// Malformed path or body.
    BadRequest(String),
    /// The addressed job does not exist.
    NotFound(String),
    /// The job is in a state that does not allow the request.
    Conflict(String),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, &'static str, String) {
        match self {
            Self::Dispatch(error) => {
                let (status, code) = match error {
                    DispatchError::StoreUnavailable { .. } => {
                        (StatusCode::SERVICE_UNAVAILABLE, "store_unavailable")
                    },
                    DispatchError::QueueClosed => (StatusCode::SERVICE_UNAVAILABLE, "queue_closed"),
                    DispatchError::InvalidInput { .. } => (StatusCode::BAD_REQUEST, "invalid_input"),
                    DispatchError::Conflict { .. } => (StatusCode::CONFLICT, "conflict"),
                    _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
                };
                (status, code, error.to_string())
            },
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, "invalid_input", message.clone()),
            Self::NotFound(message) => (StatusCode::NOT_FOUND, "not_found", message.clone()),
            Self::Conflict(message) => (StatusCode::CONFLICT, "conflict", message.clone()),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(error: DispatchError) -> Self {
        Self::Dispatch(error)
    }
}

impl From<CoreError> for ApiError {
    fn from(error: CoreError) -> Self {
        Self::Dispatch(error.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();

        if status.is_server_error() {
            error!(code, error = %message, "request failed");
        }

        let body = ErrorResponse { error: ErrorDetail { code: code.to_string(), message } };
        (status, Json(body)).into_response()
    }
}
