//! HTTP error responses.
//!
//! Every error body is `{ "message": ..., "error": ... }`. Outside development
//! mode `error` is empty and internal failures carry a generic message.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use runhost::lifecycle::LifecycleError;
use serde_json::{Value, json};
use tracing::error;

const INTERNAL_MESSAGE: &str = "internal server error";

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
    development: bool,
}

impl ApiError {
    pub fn validation(message: impl Into<String>, development: bool) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "ValidationError",
            message: message.into(),
            development,
        }
    }

    pub fn not_found(message: impl Into<String>, development: bool) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            kind: "NotFoundError",
            message: message.into(),
            development,
        }
    }

    pub fn internal(detail: impl Into<String>, development: bool) -> Self {
        let detail = detail.into();
        error!(detail = %detail, "request failed");
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "InternalError",
            message: if development {
                detail
            } else {
                INTERNAL_MESSAGE.to_string()
            },
            development,
        }
    }

    pub fn from_lifecycle(err: LifecycleError, development: bool) -> Self {
        match err {
            LifecycleError::Validation(message) => Self::validation(message, development),
            LifecycleError::NotFound(message) => Self::not_found(message, development),
            LifecycleError::Conflict(message) => Self {
                status: StatusCode::CONFLICT,
                kind: "ConflictError",
                message,
                development,
            },
            LifecycleError::Store(err) => Self::internal(err.to_string(), development),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let error = if self.development {
            json!({ "kind": self.kind, "status": self.status.as_u16() })
        } else {
            Value::Object(Default::default())
        };
        let body = json!({ "message": self.message, "error": error });
        (self.status, Json(body)).into_response()
    }
}
