//! Request building and response parsing for one endpoint call.
//!
//! # Design
//! Same split as a host-does-IO client: `build_request` turns an endpoint row
//! plus call inputs into an `HttpRequest`, `parse_response` turns whatever
//! came back into payload bytes or a classified `ApiError`. Neither touches
//! the network, so both are tested with plain values.

use bytes::Bytes;
use serde::Deserialize;

use crate::endpoints::{BodyEncoding, EndpointConfig, Params};
use crate::error::{ApiError, ErrorKind};
use crate::http::{HttpMethod, HttpRequest, HttpResponse};

/// Longest raw body excerpt quoted in an error message.
const MAX_ERROR_EXCERPT: usize = 200;

/// Build the outbound request for `endpoint`.
///
/// Path placeholders are filled from `params`. Leftover params become the
/// query string on GET/DELETE, or the form body of a form-encoded endpoint
/// called without an explicit body.
///
/// # Errors
///
/// `VALIDATION_ERROR` when a path placeholder has no value or the leftover
/// params cannot be encoded.
pub fn build_request(
    endpoint: &EndpointConfig,
    base_url: &str,
    params: &Params,
    body: Option<Bytes>,
    bearer: Option<&str>,
) -> Result<HttpRequest, ApiError> {
    let (path, leftover) = endpoint.render_path(params)?;
    let mut url = format!("{}{path}", base_url.trim_end_matches('/'));
    let mut headers = vec![("accept".to_string(), "application/json".to_string())];

    let body = match (body, endpoint.encoding) {
        (Some(body), _) => Some(body),
        (None, BodyEncoding::Form) if !leftover.is_empty() => Some(Bytes::from(encode_params(&leftover)?)),
        (None, _) => None,
    };

    let query_carries_params = matches!(endpoint.method, HttpMethod::Get | HttpMethod::Delete)
        && endpoint.encoding == BodyEncoding::Json;
    if query_carries_params && !leftover.is_empty() {
        url.push('?');
        url.push_str(&encode_params(&leftover)?);
    }

    if body.is_some() {
        headers.push((
            "content-type".to_string(),
            endpoint.encoding.content_type().to_string(),
        ));
    }
    if let Some(token) = bearer {
        headers.push(("authorization".to_string(), format!("Bearer {token}")));
    }

    Ok(HttpRequest {
        method: endpoint.method,
        url,
        headers,
        body,
    })
}

fn encode_params(params: &Params) -> Result<String, ApiError> {
    serde_urlencoded::to_string(params).map_err(|e| ApiError::validation(format!("unencodable parameters: {e}")))
}

/// Error kind for a non-2xx status, `None` for success.
pub fn classify_status(status: u16) -> Option<ErrorKind> {
    match status {
        200..=299 => None,
        401 => Some(ErrorKind::Unauthorized),
        429 | 500..=599 => Some(ErrorKind::ServiceUnavailable),
        400..=499 => Some(ErrorKind::ValidationError),
        _ => Some(ErrorKind::Unknown),
    }
}

/// Payload bytes of a successful response, or the classified error.
///
/// # Errors
///
/// Any non-2xx status, carrying the backend's `detail` message when present.
pub fn parse_response(response: &HttpResponse) -> Result<Bytes, ApiError> {
    match classify_status(response.status) {
        None => Ok(response.body.clone()),
        Some(kind) => {
            Err(ApiError::new(kind, error_message(response.status, &response.body)).with_status(response.status))
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    detail: serde_json::Value,
}

fn error_message(status: u16, body: &[u8]) -> String {
    if let Ok(ErrorBody { detail }) = serde_json::from_slice::<ErrorBody>(body) {
        return match detail {
            serde_json::Value::String(message) => message,
            other => other.to_string(),
        };
    }
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        return format!("HTTP {status}");
    }
    let excerpt: String = text.chars().take(MAX_ERROR_EXCERPT).collect();
    format!("HTTP {status}: {excerpt}")
}
