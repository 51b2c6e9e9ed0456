//! Structured HTTP error bodies synthesized by the sidecar itself.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

/// Error codes surfaced to callers in `errorCode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    MissingAppId,
    UnresolvedAppId,
    Internal,
    UnsupportedVersion,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::MissingAppId => "ERR_MISSING_APPID",
            ErrorCode::UnresolvedAppId => "ERR_UNRESOLVED_APPID",
            ErrorCode::Internal => "ERR_INTERNAL",
            ErrorCode::UnsupportedVersion => "ERR_UNSUPPORTED_VERSION",
        }
    }
}

/// JSON body: `{"errorCode": "...", "message": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub error_code: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code: code.as_str().to_string(),
            message: message.into(),
        }
    }
}

/// A request refused before any upstream call was made.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub status: StatusCode,
    pub body: ErrorResponse,
}

impl Rejection {
    pub fn bad_request(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: ErrorResponse::new(code, message),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: ErrorResponse::new(ErrorCode::Internal, message),
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
