//! Error types and error handling for the application
//!
//! This module defines custom error types that can be converted to HTTP
//! responses. All errors implement `IntoResponse` to provide consistent error
//! formatting.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application-level error types
///
/// All errors that can occur in the application are represented by this enum.
/// Each variant implements automatic conversion to HTTP responses via
/// `IntoResponse`.
#[derive(Error, Debug)]
pub enum AppError {
    /// The broker rejected a job-graph submission
    #[error("Submission failed: {0}")]
    Submission(#[from] crate::broker::FlowError),

    /// No order or job matches the given identifier
    #[error("Order not found: {0}")]
    OrderNotFound(String),

    /// A queue named in the request does not exist
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// Request body or parameters are invalid
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Internal server error (catch-all for unexpected errors)
    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Submission(_) => (StatusCode::SERVICE_UNAVAILABLE, self.to_string()),
            AppError::OrderNotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::QueueNotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            AppError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, self.to_string()),
        };

        let body = Json(json!({
            "error": error_message,
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submission_error_is_5xx() {
        let err = AppError::Submission(crate::broker::FlowError::UnknownQueue("x".to_string()));
        let response = err.into_response();
        assert!(response.status().is_server_error());
    }

    #[test]
    fn test_not_found_mapping() {
        let err = AppError::OrderNotFound("ord_1".to_string());
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
