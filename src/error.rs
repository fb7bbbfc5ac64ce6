//! HTTP error envelope.
//!
//! Every failing handler replies with `{"status":"error","message":…}` plus
//! optional extra detail fields (e.g. a `traceback` for execution failures),
//! mirroring the success envelope shape.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Map, Value};

/// A structured API error carrying the HTTP status and the JSON envelope.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    /// Extra fields merged into the error envelope.
    pub detail: Map<String, Value>,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            detail: Map::new(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    /// Attach an extra field to the error envelope.
    pub fn with_detail(mut self, key: impl Into<String>, value: Value) -> Self {
        self.detail.insert(key.into(), value);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "status": "error",
            "message": self.message,
        });
        if let Some(obj) = body.as_object_mut() {
            for (k, v) in self.detail {
                obj.insert(k, v);
            }
        }
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_has_error_status_and_message() {
        let err = ApiError::not_found("no such file").with_detail("fileName", json!("x.xlsx"));
        assert_eq!(err.status, StatusCode::NOT_FOUND);
        assert_eq!(err.message, "no such file");
        assert_eq!(err.detail.get("fileName"), Some(&json!("x.xlsx")));
    }
}
