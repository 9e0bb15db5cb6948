//! `X-Request-ID` middleware.
//!
//! A caller-supplied `X-Request-ID` is kept; otherwise a UUID v4 is minted.
//! The id is stored as a [`RequestId`] extension, wraps the rest of the
//! request in a tracing span, and is echoed on the response. It is unrelated
//! to the upstream correlation id, which is never exposed to clients.

use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use tracing::Instrument as _;
use uuid::Uuid;

static X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

/// Longest caller-supplied id accepted verbatim.
const MAX_LEN: usize = 128;

#[derive(Clone, Debug)]
pub struct RequestId(pub String);

/// Apply inside `TraceLayer` so the id span nests under the HTTP span.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get(&X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= MAX_LEN)
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    req.extensions_mut().insert(RequestId(id.clone()));

    let span = tracing::info_span!("req", id = %id);
    let mut response = next.run(req).instrument(span).await;

    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(X_REQUEST_ID.clone(), value);
    }
    response
}
