//! HTTP error responses.
//!
//! Every failure is rendered as `{"error": {"code": "...", "message": "..."}}`.
//! Infrastructure failures are logged in full and reported with a generic
//! message.

use axum::{
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use courier_core::CoreError;
use courier_delivery::DeliveryError;
use serde::Serialize;
use tracing::error;

/// Result type for handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error details.
    pub error: ErrorDetail,
}

/// Error code and description.
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    /// Stable machine-readable code.
    pub code: String,
    /// Human-readable description.
    pub message: String,
}

/// Error returned by handlers.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    /// Request body or query could not be understood.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, code: "bad_request", message: message.into() }
    }

    /// Status code of this error.
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<DeliveryError> for ApiError {
    fn from(err: DeliveryError) -> Self {
        let (status, code) = match &err {
            DeliveryError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            DeliveryError::ConfigurationError { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "validation_error")
            },
            DeliveryError::Conflict { .. } => (StatusCode::CONFLICT, "conflict"),
            DeliveryError::NetworkError { .. }
            | DeliveryError::Timeout { .. }
            | DeliveryError::ClientError { .. }
            | DeliveryError::ServerError { .. } => (StatusCode::BAD_GATEWAY, "upstream_error"),
            DeliveryError::DatabaseError { .. }
            | DeliveryError::SigningError(_)
            | DeliveryError::InternalError { .. }
            | DeliveryError::ShutdownTimeout { .. }
            | DeliveryError::WorkerPanic { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            },
        };

        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %err, category = %err.category(), "request failed");
            "internal server error".to_string()
        } else {
            err.to_string()
        };

        Self { status, code, message }
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        DeliveryError::from(err).into()
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: ErrorDetail { code: self.code.to_string(), message: self.message },
        };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_errors_map_to_status_codes() {
        let cases = [
            (DeliveryError::not_found("endpoint"), StatusCode::NOT_FOUND),
            (DeliveryError::configuration("bad url"), StatusCode::UNPROCESSABLE_ENTITY),
            (DeliveryError::conflict("retry pending"), StatusCode::CONFLICT),
            (DeliveryError::database("connection reset"), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn internal_details_are_not_exposed() {
        let err = ApiError::from(DeliveryError::database("password authentication failed"));
        assert_eq!(err.message, "internal server error");
    }
}
