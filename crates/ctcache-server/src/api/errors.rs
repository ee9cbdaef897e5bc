//! Error responses of the HTTP API
//!
//! Every failure is returned as
//! `{"error": msg, "errorDetails": {"errorCode": code, "errorMessage": msg}}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::error;

use crate::error::ServerError;

/// Status code and machine-readable code for `err`
pub fn status_and_code(err: &ServerError) -> (StatusCode, &'static str) {
    match err {
        ServerError::NotFound(_) => (StatusCode::NOT_FOUND, "ERR_NOT_FOUND"),
        ServerError::ValidationError(_) => (StatusCode::BAD_REQUEST, "ERR_VALIDATION_ERROR"),
        ServerError::Forbidden(_) => (StatusCode::FORBIDDEN, "ERR_FORBIDDEN"),
        ServerError::StorageError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ERR_STORAGE_ERROR"),
        ServerError::PersistenceError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ERR_PERSISTENCE_ERROR"),
        ServerError::ConfigError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ERR_CONFIG_ERROR"),
        ServerError::InternalError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "ERR_INTERNAL_SERVER_ERROR"),
    }
}

/// Standard JSON error response for `err`
pub fn api_error_response(err: &ServerError) -> Response {
    let (status, code) = status_and_code(err);
    let message = err.to_string();
    if !err.is_client_error() {
        error!(error = %message, code, "Request failed");
    }

    let body = Json(json!({
        "error": message,
        "errorDetails": {
            "errorCode": code,
            "errorMessage": message,
        }
    }));
    (status, body).into_response()
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        api_error_response(&self)
    }
}
