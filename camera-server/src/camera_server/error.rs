//! HTTP error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::lifecycle::LifecycleError;
use crate::reload::ConfigError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("missing or invalid API key")]
    Forbidden,

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotImplemented(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("{0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error_code: &'static str,
    message: String,
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::NotImplemented(_) => (StatusCode::NOT_IMPLEMENTED, "NOT_IMPLEMENTED"),
            ApiError::Config(ConfigError::Invalid(_)) => {
                (StatusCode::BAD_REQUEST, "INVALID_CONFIG")
            }
            ApiError::Config(ConfigError::ResetFailed(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "RESET_FAILED")
            }
            ApiError::Config(ConfigError::Persist(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "PERSIST_FAILED")
            }
            ApiError::Lifecycle(LifecycleError::AlreadyStreaming) => {
                (StatusCode::CONFLICT, "ALREADY_STREAMING")
            }
            ApiError::Lifecycle(LifecycleError::ShuttingDown) => {
                (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN")
            }
            ApiError::Lifecycle(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DRIVER_ERROR"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code) = self.status_and_code();
        if status.is_server_error() {
            warn!(error_code, "request failed: {self}");
        }
        let body = ErrorBody {
            error_code,
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
