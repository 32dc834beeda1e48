use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use lambda_core::LambdaError;
use lambda_schema::SchemaValidationError;
use serde_json::json;

pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Seconds a rate-limited producer is told to back off.
pub const RETRY_AFTER_SECS: u64 = 5;

#[derive(Debug, thiserror::Error)]
pub enum IngressError {
    #[error("invalid CloudEvent: {0}")]
    InvalidEvent(String),
    #[error("rate limit exceeded, retry later")]
    RateLimited,
    #[error("event body exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },
    #[error("method not allowed, CloudEvents are delivered with POST")]
    MethodNotAllowed,
    #[error(transparent)]
    Schema(#[from] SchemaValidationError),
    #[error(transparent)]
    Command(#[from] LambdaError),
}

impl IngressError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidEvent(_) | Self::Schema(_) => StatusCode::BAD_REQUEST,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::Command(e) => match e {
                LambdaError::Malformed(_) | LambdaError::Schema(_) | LambdaError::Validation(_) => StatusCode::BAD_REQUEST,
                LambdaError::NotFound(_) => StatusCode::NOT_FOUND,
                LambdaError::Conflict(_) => StatusCode::ACCEPTED,
                LambdaError::Transient(_) | LambdaError::Build(_) => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidEvent(_) => "invalid_cloudevent",
            Self::RateLimited => "rate_limit_exceeded",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::MethodNotAllowed => "method_not_allowed",
            Self::Schema(_) => "schema_validation_failed",
            Self::Command(e) => e.code(),
        }
    }
}

/// An error bound to the request it failed, rendered as the JSON error body.
pub struct Rejection {
    pub error: IngressError,
    pub correlation_id: String,
    pub event_id: Option<String>,
    pub event_type: Option<String>,
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let status = self.error.status();
        let mut body = json!({
            "status": "error",
            "error": self.error.code(),
            "message": self.error.to_string(),
            "correlationId": self.correlation_id,
        });
        if let Some(id) = &self.event_id {
            body["eventId"] = json!(id);
        }
        if let Some(t) = &self.event_type {
            body["eventType"] = json!(t);
        }
        let mut resp = (status, Json(body)).into_response();
        if matches!(self.error, IngressError::RateLimited) {
            resp.headers_mut().insert(axum::http::header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
        }
        if let Ok(v) = HeaderValue::from_str(&self.correlation_id) {
            resp.headers_mut().insert(CORRELATION_HEADER, v);
        }
        resp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_onto_http_status() {
        assert_eq!(IngressError::InvalidEvent("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(IngressError::Command(LambdaError::Validation("x".into())).status(), StatusCode::BAD_REQUEST);
        assert_eq!(IngressError::Command(LambdaError::NotFound("x".into())).status(), StatusCode::NOT_FOUND);
        assert_eq!(IngressError::Command(LambdaError::Transient("x".into())).status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(IngressError::Command(LambdaError::Transient("x".into())).code(), "processing_failed");
        assert_eq!(IngressError::PayloadTooLarge { limit: 8 }.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(IngressError::MethodNotAllowed.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[test]
    fn rate_limit_rejection_carries_retry_hint() {
        let resp = Rejection { error: IngressError::RateLimited, correlation_id: "abc".into(), event_id: None, event_type: None }
            .into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get("retry-after").and_then(|v| v.to_str().ok()), Some("5"));
        assert_eq!(resp.headers().get(CORRELATION_HEADER).and_then(|v| v.to_str().ok()), Some("abc"));
    }
}
