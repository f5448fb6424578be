//! Error type shared by every external collaborator.

use thiserror::Error;

use crate::domain::{ErrorKind, JobError};

/// Classified failure of an external call.
///
/// The pipeline decides about retries from `kind` alone.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct ExternalError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ExternalError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransientExternal, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    pub fn no_match(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NoMatch, message)
    }

    pub fn exhausted(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ResourceExhausted, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "cancelled")
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    /// Classify an HTTP status: 408, 429 and 5xx are worth retrying.
    pub fn from_status(status: reqwest::StatusCode, context: &str) -> Self {
        let message = format!("{context}: HTTP {status}");
        if status == reqwest::StatusCode::REQUEST_TIMEOUT
            || status == reqwest::StatusCode::TOO_MANY_REQUESTS
            || status.is_server_error()
        {
            Self::transient(message)
        } else {
            Self::fatal(message)
        }
    }
}

impl From<reqwest::Error> for ExternalError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status, "request failed");
        }
        if err.is_decode() || err.is_builder() {
            return Self::fatal(err.to_string());
        }
        // Timeouts, connection resets and other transport failures.
        Self::transient(err.to_string())
    }
}

impl From<std::io::Error> for ExternalError {
    fn from(err: std::io::Error) -> Self {
        Self::transient(err.to_string())
    }
}

impl From<ExternalError> for JobError {
    fn from(err: ExternalError) -> Self {
        JobError::new(err.kind, err.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_status_classification() {
        assert!(ExternalError::from_status(StatusCode::TOO_MANY_REQUESTS, "x").is_retryable());
        assert!(ExternalError::from_status(StatusCode::BAD_GATEWAY, "x").is_retryable());
        assert!(ExternalError::from_status(StatusCode::REQUEST_TIMEOUT, "x").is_retryable());
        let fatal = ExternalError::from_status(StatusCode::FORBIDDEN, "upload");
        assert_eq!(fatal.kind, ErrorKind::Fatal);
        assert_eq!(fatal.message, "upload: HTTP 403 Forbidden");
    }
}
