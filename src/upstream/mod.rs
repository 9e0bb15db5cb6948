//! HTTP client for the single upstream chat provider.
//!
//! The upstream speaks a browser-facing API: it expects the header set a
//! Chrome tab would send, plus a per-conversation `uniqueid` header, and it
//! replies with one JSON envelope per line (see [`envelope`]).
//!
//! [`UpstreamClient`] holds an immutable base header map built at startup.
//! Every request clones it and adds its own correlation id, so concurrent
//! requests never share a mutable header set.

pub mod envelope;

use std::{fmt, pin::Pin, time::Duration};

use anyhow::Context;
use futures_util::{Stream, StreamExt as _};
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Client,
};
use serde::Serialize;
use tokio_util::{
    codec::{FramedRead, LinesCodec, LinesCodecError},
    io::StreamReader,
};
use uuid::Uuid;

use crate::{config::UpstreamConfig, error::RelayError};

/// Path of the chat endpoint, appended to the configured base URL.
pub const CHAT_PATH: &str = "/api/v1/gpt2/free-gpt2/chat";

/// Upper bound on a single upstream line.
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Header carrying the correlation id.
const UNIQUE_ID_HEADER: &str = "uniqueid";

/// Headers the upstream expects from a browser session.
const BROWSER_HEADERS: &[(&str, &str)] = &[
    ("accept", "*/*"),
    ("accept-language", "zh-CN,zh;q=0.9"),
    ("authorization", ""),
    ("origin", "https://www.yeschat.ai"),
    ("priority", "u=1, i"),
    ("referer", "https://www.yeschat.ai/"),
    (
        "sec-ch-ua",
        r#""Chromium";v="128", "Not;A=Brand";v="24", "Google Chrome";v="128""#,
    ),
    ("sec-ch-ua-mobile", "?0"),
    ("sec-ch-ua-platform", r#""Windows""#),
    ("sec-fetch-dest", "empty"),
    ("sec-fetch-mode", "cors"),
    ("sec-fetch-site", "cross-site"),
    (
        "user-agent",
        "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/128.0.0.0 Safari/537.36",
    ),
];

/// Lines of an upstream response body, read incrementally.
pub type UpstreamLines = Pin<Box<dyn Stream<Item = Result<String, LinesCodecError>> + Send>>;

/// Per-request random identifier sent upstream as `sessionId` and `uniqueid`.
///
/// 32 lowercase hex characters (a v4 UUID without dashes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ChatBody<'a> {
    session_id: &'a str,
    prompt: &'a str,
}

/// Client for the upstream chat endpoint.
///
/// Built once at startup and shared; [`reqwest::Client`] pools connections
/// internally and is safe to use from many tasks.
pub struct UpstreamClient {
    client: Client,
    chat_url: String,
    base_headers: HeaderMap,
}

impl UpstreamClient {
    /// Construct a client for the configured upstream.
    ///
    /// `timeout_ms` bounds connection setup and each individual body read, so
    /// a long but steadily flowing answer is never cut off.
    pub fn new(cfg: &UpstreamConfig) -> anyhow::Result<Self> {
        let mut base_headers = HeaderMap::new();
        let overrides = cfg.headers.iter().map(|(k, v)| (k.as_str(), v.as_str()));
        for (name, value) in BROWSER_HEADERS.iter().copied().chain(overrides) {
            base_headers.insert(
                HeaderName::from_bytes(name.as_bytes())
                    .with_context(|| format!("invalid header name `{name}`"))?,
                HeaderValue::from_str(value)
                    .with_context(|| format!("invalid value for header `{name}`"))?,
            );
        }

        let timeout = Duration::from_millis(cfg.timeout_ms);
        let client = Client::builder()
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()
            .context("building reqwest client")?;

        Ok(Self {
            client,
            chat_url: format!("{}{CHAT_PATH}", cfg.base_url.trim_end_matches('/')),
            base_headers,
        })
    }

    /// Header set for one request: the static base plus its correlation id.
    pub fn headers_for(&self, id: &CorrelationId) -> anyhow::Result<HeaderMap> {
        let mut headers = self.base_headers.clone();
        headers.insert(
            UNIQUE_ID_HEADER,
            HeaderValue::from_str(id.as_str()).context("correlation id is not a valid header")?,
        );
        Ok(headers)
    }

    /// POST `prompt` upstream and return the response body as a line stream.
    ///
    /// Only the status line and headers are awaited here; the body is read
    /// lazily by whoever polls the returned stream.
    ///
    /// # Errors
    /// [`RelayError::UpstreamStatus`] for a non-2xx answer (with the body text),
    /// [`RelayError::Transport`] when the request cannot be sent.
    pub async fn open_chat(
        &self,
        id: &CorrelationId,
        prompt: &str,
    ) -> Result<UpstreamLines, RelayError> {
        let body = ChatBody {
            session_id: id.as_str(),
            prompt,
        };
        let response = self
            .client
            .post(&self.chat_url)
            .headers(self.headers_for(id)?)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(RelayError::UpstreamStatus { status, body });
        }

        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other));
        let lines = FramedRead::new(
            StreamReader::new(bytes),
            LinesCodec::new_with_max_length(MAX_LINE_BYTES),
        );
        Ok(Box::pin(lines))
    }
}
