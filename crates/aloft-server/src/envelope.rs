//! Common response envelope for the Control API: `{success, data|error,
//! timestamp, version}`.

use aloft_types::{AloftError, ErrorKind};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

const VERSION: &str = "1.0.0";

#[derive(Serialize)]
struct ErrorBody {
    kind: ErrorKind,
    message: String,
}

#[derive(Serialize)]
struct Envelope<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
    timestamp: String,
    version: &'static str,
}

/// Wraps a successful payload in the envelope and a 200 status.
pub fn ok<T: Serialize>(data: T) -> Response {
    ok_with_status(StatusCode::OK, data)
}

pub fn ok_with_status<T: Serialize>(status: StatusCode, data: T) -> Response {
    let body = Envelope {
        success: true,
        data: Some(data),
        error: None,
        timestamp: chrono::Utc::now().to_rfc3339(),
        version: VERSION,
    };
    (status, Json(body)).into_response()
}

/// Maps an `AloftError` to its HTTP status per the error handling design and
/// wraps it in the envelope's error shape. Every `Timeout` surfaced by this
/// API is a transmission boundary (30s max duration), which is a 400, not a
/// 504 — there is no long-poll endpoint for `Timeout` to mean anything else.
pub fn error(err: AloftError) -> Response {
    let status = status_for(&err);
    let body: Envelope<()> = Envelope {
        success: false,
        data: None,
        error: Some(ErrorBody {
            kind: err.kind(),
            message: err.message().to_string(),
        }),
        timestamp: chrono::Utc::now().to_rfc3339(),
        version: VERSION,
    };
    (status, Json(body)).into_response()
}

fn status_for(err: &AloftError) -> StatusCode {
    match err.kind() {
        ErrorKind::Unauthenticated => StatusCode::UNAUTHORIZED,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Invalid => StatusCode::BAD_REQUEST,
        ErrorKind::Timeout => StatusCode::BAD_REQUEST,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Wraps the `AloftError` → `Response` conversion so handlers can use `?`.
pub struct ApiError(pub AloftError);

impl From<AloftError> for ApiError {
    fn from(e: AloftError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        error(self.0)
    }
}
