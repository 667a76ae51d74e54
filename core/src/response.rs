//! The envelope every gateway call resolves to.
//!
//! # Design
//! Gateway calls never panic or return a bare `Result` across the public
//! surface: they resolve to `ApiResponse`, which serializes as
//! `{success, data?, error?}` for the UI layer. `into_result` converts back
//! to a `Result` so Rust callers can use `?`.

use serde::Serialize;

use crate::error::ApiError;

/// Result envelope handed back by every gateway call.
///
/// Holds either data or an error, never both; the fields are private so no
/// caller can assemble a half-filled envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ApiError>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(error: ApiError) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.success
    }

    pub fn data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    pub fn error(&self) -> Option<&ApiError> {
        self.error.as_ref()
    }

    pub fn into_result(self) -> Result<T, ApiError> {
        match (self.data, self.error) {
            (Some(data), None) => Ok(data),
            (_, Some(error)) => Err(error),
            (None, None) => Err(ApiError::unknown("empty response envelope")),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> ApiResponse<U> {
        ApiResponse {
            success: self.success,
            data: self.data.map(f),
            error: self.error,
        }
    }
}

impl<T> From<Result<T, ApiError>> for ApiResponse<T> {
    fn from(result: Result<T, ApiError>) -> Self {
        match result {
            Ok(data) => Self::ok(data),
            Err(error) => Self::err(error),
        }
    }
}
