//! Client-facing API: the OpenAI-compatible surface.
//!
//! Handlers stay thin: validation and the upstream call live in
//! [`crate::relay`], chunk shaping in [`crate::translate`]. This module only
//! picks the response mode and sets HTTP details.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, Extensions, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::{
    api::{client_auth::client_auth_middleware, request_id::RequestId},
    error::RelayError,
    relay::{self, RelayState},
    translate::{collect, sse_body, ChatRequest},
};

/// Build the client-facing axum router.
///
/// CORS allows any origin, method and header; the CORS layer answers every
/// `OPTIONS` request itself with 200. Only the chat route requires the shared
/// secret.
pub fn router(state: Arc<RelayState>) -> Router {
    let chat = post(chat_completions).route_layer(middleware::from_fn_with_state(
        Arc::clone(&state),
        client_auth_middleware,
    ));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", chat)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// `GET /healthz`: liveness probe, no dependencies.
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

/// `GET /v1/models`: the allow-list in OpenAI list shape.
pub async fn list_models(State(state): State<Arc<RelayState>>) -> impl IntoResponse {
    Json(json!({ "object": "list", "data": state.config.models }))
}

/// `POST /v1/chat/completions`: relay one chat request upstream.
///
/// Upstream failures that happen before the first chunk are returned as
/// plain HTTP errors in both modes. With `stream: true` the chunks are then
/// relayed as SSE; otherwise they are folded into a single completion.
pub async fn chat_completions(
    State(state): State<Arc<RelayState>>,
    extensions: Extensions,
    Json(request): Json<ChatRequest>,
) -> Result<Response, RelayError> {
    let request_id = extensions
        .get::<RequestId>()
        .map(|id| id.0.as_str())
        .unwrap_or("-");
    let rx = relay::open(&state, &request).await?;

    if request.stream {
        info!(model = %request.model, request_id, "streaming response");
        let headers = [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ];
        return Ok((headers, Body::from_stream(sse_body(rx))).into_response());
    }

    info!(model = %request.model, request_id, "buffered response");
    let completion = collect(rx, &request.model).await?;
    Ok(Json(completion).into_response())
}
