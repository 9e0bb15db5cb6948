//! Configuration types for chat-relay.
//!
//! Config is loaded once at startup from an optional TOML file and validated
//! before the server opens its port. Every field has a default, so a relay
//! with no config file talks to the stock upstream on port 8002.
//!
//! # Example
//! ```toml
//! [server]
//! port = 8002
//!
//! [upstream]
//! base_url   = "https://finechatserver.erweima.ai"
//! timeout_ms = 120000
//!
//! [auth]
//! secret_env = "APP_SECRET"
//!
//! [[models]]
//! id   = "gpt-4o"
//! name = "gpt-4o"
//! ```

use std::{
    collections::{BTreeMap, HashSet},
    path::Path,
};

use anyhow::Context;
use reqwest::header::{HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};

/// Top-level relay configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    /// Model allow-list. Requests naming any other model are rejected before
    /// the upstream is contacted.
    #[serde(default = "defaults::models")]
    pub models: Vec<ModelEntry>,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("parsing config TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Built-in configuration used when no file is present.
    pub fn builtin() -> Self {
        Self {
            models: defaults::models(),
            ..Self::default()
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.models.is_empty(), "[[models]] allow-list must not be empty");

        let mut seen = HashSet::new();
        for model in &self.models {
            anyhow::ensure!(!model.id.is_empty(), "[[models]] entry with empty id");
            anyhow::ensure!(
                seen.insert(model.id.as_str()),
                "duplicate model id `{}` in [[models]]",
                model.id
            );
        }

        let base = &self.upstream.base_url;
        anyhow::ensure!(
            base.starts_with("http://") || base.starts_with("https://"),
            "upstream base_url `{base}` must start with http:// or https://"
        );
        anyhow::ensure!(self.upstream.timeout_ms > 0, "upstream timeout_ms must be positive");

        for (name, value) in &self.upstream.headers {
            HeaderName::from_bytes(name.as_bytes())
                .with_context(|| format!("invalid upstream header name `{name}`"))?;
            HeaderValue::from_str(value)
                .with_context(|| format!("invalid value for upstream header `{name}`"))?;
        }

        anyhow::ensure!(!self.auth.secret_env.is_empty(), "auth secret_env must not be empty");

        Ok(())
    }

    /// Whether `model` is on the allow-list.
    pub fn allows(&self, model: &str) -> bool {
        self.models.iter().any(|m| m.id == model)
    }

    /// Comma-separated allow-list ids, for error messages.
    pub fn allowed_ids(&self) -> String {
        self.models
            .iter()
            .map(|m| m.id.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Listener settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Port for the client API (default: 8002).
    #[serde(default = "defaults::port")]
    pub port: u16,

    /// Log filter override (`RUST_LOG` takes precedence when set).
    #[serde(default)]
    pub log_level: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: defaults::port(),
            log_level: None,
        }
    }
}

/// The single upstream chat provider.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Base URL without the chat path.
    #[serde(default = "defaults::base_url")]
    pub base_url: String,

    /// Connect and per-read timeout in milliseconds (default: 120 000).
    #[serde(default = "defaults::timeout_ms")]
    pub timeout_ms: u64,

    /// Extra headers merged over the built-in browser header set.
    ///
    /// A key that matches a built-in header replaces it.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: defaults::base_url(),
            timeout_ms: defaults::timeout_ms(),
            headers: BTreeMap::new(),
        }
    }
}

/// Shared-secret settings.
///
/// The secret itself never lives in the config file; only the name of the
/// environment variable that holds it.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    #[serde(default = "defaults::secret_env")]
    pub secret_env: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            secret_env: defaults::secret_env(),
        }
    }
}

impl AuthConfig {
    /// Resolve the shared secret from the configured environment variable.
    ///
    /// An empty value counts as unset.
    pub fn secret(&self) -> Option<String> {
        std::env::var(&self.secret_env).ok().filter(|s| !s.is_empty())
    }
}

/// One allow-listed model, as shown by `GET /v1/models`.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ModelEntry {
    pub id: String,
    pub name: String,
}

impl ModelEntry {
    fn same(id: &str) -> Self {
        Self {
            id: id.to_owned(),
            name: id.to_owned(),
        }
    }
}

mod defaults {
    use super::ModelEntry;

    pub fn port() -> u16 { 8002 }
    pub fn base_url() -> String { "https://finechatserver.erweima.ai".into() }
    pub fn timeout_ms() -> u64 { 120_000 }
    pub fn secret_env() -> String { "APP_SECRET".into() }
    pub fn models() -> Vec<ModelEntry> {
        vec![ModelEntry::same("gpt-4o"), ModelEntry::same("gpt-4o-mini")]
    }
}
