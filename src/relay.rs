//! Per-request orchestration: allow-list check, prompt flattening, the single
//! upstream call, and handing its body to the translator task.
//!
//! Everything in [`RelayState`] is fixed at startup and read without locks.
//! All per-request data (correlation id, prompt, header set, chunk channel)
//! lives on the request's own task.

use std::{sync::Arc, time::Instant};

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{debug, info, Instrument as _};

use crate::{
    config::Config,
    error::RelayError,
    translate::{flatten_prompt, translate, ChatRequest, ChunkReceiver, CHANNEL_CAPACITY},
    upstream::{CorrelationId, UpstreamClient},
};

/// Shared application state injected into every handler via [`axum::extract::State`].
pub struct RelayState {
    pub config: Arc<Config>,
    /// Bearer token clients must present on `POST /v1/chat/completions`.
    pub secret: String,
    pub upstream: UpstreamClient,
}

impl RelayState {
    pub fn new(config: Arc<Config>, secret: String) -> anyhow::Result<Self> {
        let upstream = UpstreamClient::new(&config.upstream)?;
        Ok(Self {
            config,
            secret,
            upstream,
        })
    }

    /// Build state with the shared secret read from the configured env var.
    ///
    /// Refuses to start without a secret: every chat request would be
    /// rejected anyway.
    pub fn from_env(config: Arc<Config>) -> anyhow::Result<Self> {
        let secret = config.auth.secret().with_context(|| {
            format!(
                "shared secret not set: export {} before starting",
                config.auth.secret_env
            )
        })?;
        Self::new(config, secret)
    }
}

/// Validate `request`, open the upstream call, and start translating.
///
/// Returns once the upstream has answered with a success status; chunks then
/// arrive on the returned receiver. Dropping the receiver stops the
/// translator and releases the upstream connection.
///
/// # Errors
/// [`RelayError::UnsupportedModel`] before any network traffic, or whatever
/// [`UpstreamClient::open_chat`] reports.
#[tracing::instrument(
    skip(state, request),
    fields(model = %request.model, stream = request.stream, session = tracing::field::Empty)
)]
pub async fn open(state: &RelayState, request: &ChatRequest) -> Result<ChunkReceiver, RelayError> {
    if !state.config.allows(&request.model) {
        return Err(RelayError::UnsupportedModel {
            model: request.model.clone(),
            allowed: state.config.allowed_ids(),
        });
    }

    let id = CorrelationId::new();
    tracing::Span::current().record("session", id.as_str());

    let prompt = flatten_prompt(&request.messages);
    debug!(messages = request.messages.len(), prompt_bytes = prompt.len(), "forwarding to upstream");

    let t0 = Instant::now();
    let lines = state.upstream.open_chat(&id, &prompt).await?;
    info!(latency_ms = t0.elapsed().as_millis() as u64, "upstream accepted request");

    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(
        translate(lines, request.model.clone(), tx).instrument(tracing::Span::current()),
    );
    Ok(rx)
}
