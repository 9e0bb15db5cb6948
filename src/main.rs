use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use tokio::signal;
use tracing::info;

mod api;
mod config;
mod error;
mod relay;
mod translate;
mod upstream;

use config::Config;

/// Config file picked up from the working directory when `RELAY_CONFIG` is unset.
const DEFAULT_CONFIG_FILE: &str = "relay.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // When invoked as a container HEALTHCHECK, hit /healthz and exit immediately.
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    let (config, source) = load_config()?;

    let default_filter = config
        .server
        .log_level
        .clone()
        .unwrap_or_else(|| "chat_relay=info,tower_http=warn".into());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    info!(
        config = %source,
        port = config.server.port,
        upstream = %config.upstream.base_url,
        models = %config.allowed_ids(),
        "chat-relay starting"
    );

    let state = Arc::new(relay::RelayState::from_env(Arc::new(config))?);

    let addr: SocketAddr = format!("0.0.0.0:{}", state.config.server.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "client API listening");

    let app = api::client::router(Arc::clone(&state))
        .layer(axum::middleware::from_fn(api::request_id::request_id_middleware))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
                .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO)),
        );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("client API server error")?;

    info!("shutdown complete");
    Ok(())
}

/// Resolve and load the config file.
///
/// An explicit `RELAY_CONFIG` must point at a readable file. Without it,
/// `relay.toml` in the working directory is used if present, otherwise the
/// built-in defaults.
fn load_config() -> anyhow::Result<(Config, String)> {
    if let Ok(path) = std::env::var("RELAY_CONFIG") {
        let path = PathBuf::from(path);
        let config = Config::load(&path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?;
        return Ok((config, path.display().to_string()));
    }

    let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
    if fallback.is_file() {
        let config = Config::load(&fallback)
            .with_context(|| format!("Failed to load config from {}", fallback.display()))?;
        return Ok((config, fallback.display().to_string()));
    }

    Ok((Config::builtin(), "built-in defaults".into()))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

/// Lightweight healthcheck: GET /healthz and exit 0 on 200, 1 otherwise.
/// Invoked via `chat-relay --healthcheck`.
async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("RELAY_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(8002);

    let url = format!("http://127.0.0.1:{port}/healthz");
    let healthy = match reqwest::get(&url).await {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    };

    std::process::exit(if healthy { 0 } else { 1 });
}
