//! Request-scoped gateway errors.
//!
//! Every error renders as `{"code": "...", "message": "..."}` with the
//! matching status code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::registry::SelectError;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("no route for {method} {path}")]
    NotFound { method: String, path: String },

    #[error("{0}")]
    Unauthenticated(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("upstream request failed: {0}")]
    BadGateway(String),

    #[error("upstream did not respond in time")]
    GatewayTimeout,

    #[error("request body exceeds {0} bytes")]
    PayloadTooLarge(usize),

    #[error("{0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: String,
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::NotFound { .. } => StatusCode::NOT_FOUND,
            GatewayError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            GatewayError::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::NotFound { .. } => "not_found",
            GatewayError::Unauthenticated(_) => "unauthenticated",
            GatewayError::Unavailable(_) => "unavailable",
            GatewayError::BadGateway(_) => "bad_gateway",
            GatewayError::GatewayTimeout => "deadline_exceeded",
            GatewayError::PayloadTooLarge(_) => "resource_exhausted",
            GatewayError::Internal(_) => "internal",
        }
    }
}

impl From<SelectError> for GatewayError {
    fn from(e: SelectError) -> Self {
        GatewayError::Unavailable(e.to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code(),
            message: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_renders_json() {
        let response = GatewayError::NotFound {
            method: "GET".into(),
            path: "/nope".into(),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["code"], "not_found");
        assert_eq!(json["message"], "no route for GET /nope");
    }

    #[test]
    fn test_select_errors_are_unavailable() {
        let e: GatewayError = SelectError::NoLiveTarget("blog".into()).into();
        assert_eq!(e.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
