//! Business-facing HTTP API.

pub mod devices;
pub mod orders;
pub mod response;

use axum::extract::{Request, State};
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use tracing::Instrument;
use uuid::Uuid;

use crate::state::AppState;
use response::RequestId;

/// Tag every request with a correlation id (honouring a caller-supplied
/// `x-request-id`) and wrap the handling path in a span carrying it.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    req.extensions_mut().insert(RequestId(id.clone()));

    let span = tracing::info_span!(
        "http",
        request_id = %id,
        method = %req.method(),
        path = %req.uri().path(),
    );
    let mut response = next.run(req).instrument(span).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// API-key gate. An empty key list leaves the API open (local and test
/// deployments); otherwise `x-api-key` must match one configured key.
pub async fn api_key_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    if state.config.api_keys.is_empty() {
        return next.run(req).await;
    }
    let presented = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok());
    let authorized =
        presented.is_some_and(|key| state.config.api_keys.iter().any(|k| k == key));
    if authorized {
        return next.run(req).await;
    }
    let request_id = req
        .extensions()
        .get::<RequestId>()
        .cloned()
        .unwrap_or_else(|| RequestId("unknown".to_owned()));
    response::unauthorized(&request_id)
}
