//! API error handling.
//!
//! Every failure leaves the API as `{code, message, details?}`.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::api::signed::SignatureError;
use crate::error::Error;
use crate::resolver::SourceFailure;

/// API error response body.
#[derive(Debug, Serialize)]
pub struct ApiErrorResponse {
    /// Error code for programmatic handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: String,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "BAD_REQUEST", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "FORBIDDEN", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "NOT_FOUND", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(StatusCode::CONFLICT, "CONFLICT", message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, "VALIDATION_ERROR", message)
    }

    /// Every mirror source failed, so "nothing found" cannot be claimed.
    pub fn no_results(failures: &[SourceFailure]) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "NO_RESULTS",
            "no mirror source answered",
        )
        .with_details(serde_json::json!({ "failures": failures }))
    }

    /// Per-user job cap reached.
    pub fn limit_reached(user_limit: u32, active: u32) -> Self {
        Self::new(
            StatusCode::TOO_MANY_REQUESTS,
            "LIMIT_REACHED",
            format!("at most {user_limit} downloads may run at once"),
        )
        .with_details(serde_json::json!({ "user_limit": user_limit, "active": active }))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ApiErrorResponse {
            code: self.code,
            message: self.message,
            details: self.details,
        };
        (self.status, Json(body)).into_response()
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::NotFound { entity_type, id } => {
                ApiError::not_found(format!("{entity_type} '{id}' not found"))
            }
            Error::Validation(msg) => ApiError::validation(msg),
            Error::InvalidStateTransition { from, to } => {
                ApiError::conflict(format!("job cannot move from {from} to {to}"))
            }
            Error::Http(e) => {
                tracing::error!(error = %e, "Upstream call failed");
                ApiError::new(
                    StatusCode::BAD_GATEWAY,
                    "UPSTREAM_ERROR",
                    "an upstream service failed",
                )
            }
            other => {
                // Storage, IO and configuration details stay in the log.
                tracing::error!(error = %other, "Request failed");
                ApiError::internal("internal error")
            }
        }
    }
}

impl From<SignatureError> for ApiError {
    fn from(err: SignatureError) -> Self {
        match err {
            SignatureError::Malformed(msg) => ApiError::bad_request(msg),
            other => ApiError::forbidden(other.to_string()),
        }
    }
}

/// Result type for API handlers.
pub type ApiResult<T> = Result<T, ApiError>;
