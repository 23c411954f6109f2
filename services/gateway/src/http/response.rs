//! The response envelope.
//!
//! Every endpoint answers `{code, message, data, request_id, timestamp}`;
//! `code` is `0` on success and the HTTP status code otherwise.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Serialize;

/// Correlation id for one API request, installed by the middleware.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

impl<S> FromRequestParts<S> for RequestId
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(parts
            .extensions
            .get::<RequestId>()
            .cloned()
            .unwrap_or_else(|| RequestId("unknown".to_owned())))
    }
}

#[derive(Debug, Serialize)]
pub struct Envelope {
    pub code: i32,
    pub message: String,
    pub data: serde_json::Value,
    pub request_id: String,
    pub timestamp: i64,
}

fn envelope(
    status: StatusCode,
    code: i32,
    message: impl Into<String>,
    data: serde_json::Value,
    request_id: &RequestId,
) -> Response {
    (
        status,
        Json(Envelope {
            code,
            message: message.into(),
            data,
            request_id: request_id.0.clone(),
            timestamp: Utc::now().timestamp(),
        }),
    )
        .into_response()
}

pub fn ok(request_id: &RequestId, data: serde_json::Value) -> Response {
    envelope(StatusCode::OK, 0, "ok", data, request_id)
}

pub fn error(
    status: StatusCode,
    message: impl Into<String>,
    data: serde_json::Value,
    request_id: &RequestId,
) -> Response {
    envelope(status, i32::from(status.as_u16()), message, data, request_id)
}

pub fn bad_request(request_id: &RequestId, message: impl Into<String>) -> Response {
    error(StatusCode::BAD_REQUEST, message, serde_json::Value::Null, request_id)
}

pub fn not_found(request_id: &RequestId, message: impl Into<String>) -> Response {
    error(StatusCode::NOT_FOUND, message, serde_json::Value::Null, request_id)
}

pub fn conflict(
    request_id: &RequestId,
    message: impl Into<String>,
    data: serde_json::Value,
) -> Response {
    error(StatusCode::CONFLICT, message, data, request_id)
}

pub fn service_unavailable(request_id: &RequestId, message: impl Into<String>) -> Response {
    error(
        StatusCode::SERVICE_UNAVAILABLE,
        message,
        serde_json::Value::Null,
        request_id,
    )
}

pub fn internal_error(request_id: &RequestId, err: impl std::fmt::Display) -> Response {
    error(
        StatusCode::INTERNAL_SERVER_ERROR,
        err.to_string(),
        serde_json::Value::Null,
        request_id,
    )
}

pub fn unauthorized(request_id: &RequestId) -> Response {
    error(
        StatusCode::UNAUTHORIZED,
        "missing or invalid api key",
        serde_json::Value::Null,
        request_id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn parse(response: Response) -> (StatusCode, serde_json::Value) {
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn ok_envelope_has_code_zero() {
        let rid = RequestId("req-1".to_owned());
        let (status, body) = parse(ok(&rid, serde_json::json!({ "x": 1 }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["code"], 0);
        assert_eq!(body["message"], "ok");
        assert_eq!(body["data"]["x"], 1);
        assert_eq!(body["request_id"], "req-1");
        assert!(body["timestamp"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn error_envelope_carries_the_status_as_code() {
        let rid = RequestId("req-2".to_owned());
        let (status, body) = parse(conflict(
            &rid,
            "port is busy",
            serde_json::json!({ "current_order": "THDx001" }),
        ))
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], 409);
        assert_eq!(body["data"]["current_order"], "THDx001");
    }

    #[tokio::test]
    async fn service_unavailable_has_null_data() {
        let rid = RequestId("req-3".to_owned());
        let (status, body) = parse(service_unavailable(&rid, "device offline")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["code"], 503);
        assert!(body["data"].is_null());
    }
}
