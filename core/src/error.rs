//! Error taxonomy surfaced by the gateway.
//!
//! # Design
//! Every failed call produces exactly one `ApiError`. The `kind` drives the
//! gateway's own behavior (retry, token invalidation) and gives the UI enough
//! to choose between a retry button, a re-login prompt, or a generic failure.
//! `retryable` is derived from `kind` at construction so the two never
//! disagree.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Classification of a failed call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// No response reached the client (connect failure, reset, DNS).
    NetworkError,

    /// The per-endpoint deadline elapsed.
    Timeout,

    /// The backend answered 401, or no usable token is available.
    Unauthorized,

    /// 5xx, 429, or an explicit health-check failure.
    ServiceUnavailable,

    /// 4xx other than 401/429, or a request the gateway refused to build.
    ValidationError,

    /// Programmer error: the endpoint key has no registry row or no mock.
    UnknownEndpoint,

    /// Anything unclassified, including undecodable payloads.
    Unknown,
}

impl ErrorKind {
    /// Whether the gateway retries this kind locally before surfacing it.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::NetworkError | ErrorKind::Timeout | ErrorKind::ServiceUnavailable
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NetworkError => "NETWORK_ERROR",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Unauthorized => "UNAUTHORIZED",
            ErrorKind::ServiceUnavailable => "SERVICE_UNAVAILABLE",
            ErrorKind::ValidationError => "VALIDATION_ERROR",
            ErrorKind::UnknownEndpoint => "UNKNOWN_ENDPOINT",
            ErrorKind::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error half of the `ApiResponse` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "camelCase")]
#[error("{kind}: {message}")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    pub http_status: Option<u16>,
    pub retryable: bool,
}

impl ApiError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            http_status: None,
            retryable: kind.is_retryable(),
        }
    }

    /// Attach the upstream HTTP status that produced this error.
    #[must_use]
    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    #[must_use]
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NetworkError, message)
    }

    #[must_use]
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    #[must_use]
    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ServiceUnavailable, message)
    }

    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValidationError, message)
    }

    #[must_use]
    pub fn unknown_endpoint(key: &str) -> Self {
        Self::new(
            ErrorKind::UnknownEndpoint,
            format!("no endpoint registered for key `{key}`"),
        )
    }

    #[must_use]
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unknown, message)
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::unknown(format!("payload could not be decoded: {err}"))
    }
}
