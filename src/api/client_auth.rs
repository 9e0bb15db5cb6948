//! Shared-secret Bearer authentication for the chat endpoint.
//!
//! `POST /v1/chat/completions` must carry `Authorization: Bearer <secret>`
//! where `<secret>` equals the value loaded at startup. Anything else (no
//! header, another scheme, a different token) gets 403 `Invalid APP_SECRET`.
//! CORS preflights never reach this middleware; the CORS layer answers them.
//!
//! # Security note
//! Tokens are compared with `==`. The secret is a single static value and
//! the relay makes no attempt to resist timing analysis.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::{error::RelayError, relay::RelayState};

/// Extract the token from an `Authorization: Bearer <token>` header.
///
/// The scheme is matched case-insensitively.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    scheme
        .eq_ignore_ascii_case("bearer")
        .then_some(token.trim())
        .filter(|t| !t.is_empty())
}

/// Axum middleware: rejects requests whose Bearer token is not the shared secret.
pub async fn client_auth_middleware(
    State(state): State<Arc<RelayState>>,
    req: Request,
    next: Next,
) -> Response {
    let authorized = bearer_token(req.headers()) == Some(state.secret.as_str());
    if authorized {
        next.run(req).await
    } else {
        RelayError::InvalidSecret.into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{HeaderMap, HeaderValue, Request, StatusCode},
        middleware,
        routing::post,
        Router,
    };
    use tower::ServiceExt;

    use crate::{config::Config, relay::RelayState};

    fn app() -> Router {
        let state = Arc::new(RelayState::new(Arc::new(Config::builtin()), "letmein".into()).unwrap());
        Router::new()
            .route("/", post(|| async { "through" }))
            .layer(middleware::from_fn_with_state(
                state.clone(),
                super::client_auth_middleware,
            ))
            .with_state(state)
    }

    async fn send(req: Request<Body>) -> (StatusCode, String) {
        let resp = app().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = to_bytes(resp.into_body(), 1024).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    fn post_with_auth(value: &str) -> Request<Body> {
        Request::post("/")
            .header("authorization", value)
            .body(Body::empty())
            .unwrap()
    }

    // -----------------------------------------------------------------------
    // bearer_token
    // -----------------------------------------------------------------------

    #[test]
    fn bearer_token_parses_scheme_case_insensitively() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("bearer abc"));
        assert_eq!(super::bearer_token(&headers), Some("abc"));

        headers.insert("authorization", HeaderValue::from_static("Bearer  abc "));
        assert_eq!(super::bearer_token(&headers), Some("abc"));
    }

    #[test]
    fn bearer_token_rejects_other_schemes_and_empty_tokens() {
        let mut headers = HeaderMap::new();
        assert_eq!(super::bearer_token(&headers), None);

        headers.insert("authorization", HeaderValue::from_static("Basic abc"));
        assert_eq!(super::bearer_token(&headers), None);

        headers.insert("authorization", HeaderValue::from_static("Bearer "));
        assert_eq!(super::bearer_token(&headers), None);

        headers.insert("authorization", HeaderValue::from_static("Bearerabc"));
        assert_eq!(super::bearer_token(&headers), None);
    }

    // -----------------------------------------------------------------------
    // Middleware
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn matching_secret_passes_through() {
        let (status, body) = send(post_with_auth("Bearer letmein")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "through");
    }

    #[tokio::test]
    async fn wrong_secret_returns_403() {
        let (status, body) = send(post_with_auth("Bearer nope")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body.contains("Invalid APP_SECRET"), "body: {body}");
    }

    #[tokio::test]
    async fn missing_header_returns_403() {
        let (status, _) = send(Request::post("/").body(Body::empty()).unwrap()).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }
}
