//! Upstream → OpenAI chat-completions translation.
//!
//! The upstream emits one JSON envelope per line. [`translate`] reads those
//! lines as they arrive and turns each envelope into one or two
//! [`CompletionChunk`]s, finishing with an empty `finish_reason: "stop"`
//! chunk. The chunks travel over a bounded channel to one of two consumers:
//!
//! - [`sse_body`] frames them as `data: <json>\n\n` for a streaming client and
//!   appends `data: [DONE]\n\n`.
//! - [`collect`] concatenates their content into a single [`Completion`] for a
//!   buffered client.
//!
//! Both consumers see the exact same chunk sequence, so the assistant text is
//! identical in either mode.

use std::convert::Infallible;

use bytes::Bytes;
use futures_util::{Stream, StreamExt as _};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::codec::LinesCodecError;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    error::RelayError,
    upstream::envelope::{decode_line, Envelope, Line},
};

/// Capacity of the translator → response channel.
pub const CHANNEL_CAPACITY: usize = 32;

/// Terminal SSE frame for a successful stream.
const SSE_DONE: &[u8] = b"data: [DONE]\n\n";

pub type ChunkSender = mpsc::Sender<Result<CompletionChunk, RelayError>>;
pub type ChunkReceiver = mpsc::Receiver<Result<CompletionChunk, RelayError>>;

// ──────────────────────────────────────────────────────────────────────────────
// Client request
// ──────────────────────────────────────────────────────────────────────────────

/// Body of `POST /v1/chat/completions`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// Flatten a conversation into the single prompt string the upstream takes.
///
/// Each message becomes `"<Label>: <content>"`; `user` is labelled `User`,
/// every other role `Assistant`. Messages are joined with `\n`.
pub fn flatten_prompt(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| {
            let label = if m.role == "user" { "User" } else { "Assistant" };
            format!("{label}: {}", m.content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ──────────────────────────────────────────────────────────────────────────────
// OpenAI response shapes
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Delta {
    pub content: String,
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<FinishReason>,
}

/// One `chat.completion.chunk` object.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
    pub usage: Option<serde_json::Value>,
}

impl CompletionChunk {
    fn new(model: &str, content: String, finish_reason: Option<FinishReason>) -> Self {
        Self {
            id: completion_id(),
            object: "chat.completion.chunk".into(),
            created: chrono::Utc::now().timestamp(),
            model: model.to_owned(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: Delta {
                    content,
                    role: "assistant".into(),
                },
                finish_reason,
            }],
            usage: None,
        }
    }

    /// A content-bearing chunk.
    pub fn text(model: &str, content: impl Into<String>) -> Self {
        Self::new(model, content.into(), None)
    }

    /// The empty closing chunk with `finish_reason: "stop"`.
    pub fn stop(model: &str) -> Self {
        Self::new(model, String::new(), Some(FinishReason::Stop))
    }

    pub fn content(&self) -> &str {
        self.choices
            .first()
            .map(|c| c.delta.content.as_str())
            .unwrap_or("")
    }

    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.choices.first().and_then(|c| c.finish_reason)
    }

    /// Frame as a single SSE event.
    pub fn to_sse_frame(&self) -> serde_json::Result<String> {
        Ok(format!("data: {}\n\n", serde_json::to_string(self)?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AssistantMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: FinishReason,
}

/// A buffered `chat.completion` object.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Completion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Option<serde_json::Value>,
}

impl Completion {
    pub fn new(model: &str, content: String) -> Self {
        Self {
            id: completion_id(),
            object: "chat.completion".into(),
            created: chrono::Utc::now().timestamp(),
            model: model.to_owned(),
            choices: vec![CompletionChoice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant".into(),
                    content,
                },
                finish_reason: FinishReason::Stop,
            }],
            usage: None,
        }
    }
}

fn completion_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4())
}

// ──────────────────────────────────────────────────────────────────────────────
// Translation
// ──────────────────────────────────────────────────────────────────────────────

/// Markdown embedding of an upstream image link.
pub fn image_markdown(url: &str) -> String {
    format!("\n ![]({url}) \n")
}

/// Chunks produced by a single envelope: an image chunk when `url` is set,
/// then the message chunk.
pub fn chunks_for(envelope: &Envelope, model: &str) -> Vec<CompletionChunk> {
    let mut chunks = Vec::with_capacity(2);
    if let Some(url) = &envelope.url {
        chunks.push(CompletionChunk::text(model, image_markdown(url)));
    }
    chunks.push(CompletionChunk::text(model, envelope.message.as_str()));
    chunks
}

/// Read upstream `lines` and send the translated chunks to `tx`.
///
/// Ends with a stop chunk once the upstream is exhausted or sends `[DONE]`.
/// On a read or decode failure the error is sent instead and nothing follows
/// it. Returns early, dropping `lines`, as soon as the receiver goes away,
/// even while waiting on a slow upstream.
pub async fn translate<S>(mut lines: S, model: String, tx: ChunkSender)
where
    S: Stream<Item = Result<String, LinesCodecError>> + Unpin,
{
    let mut forwarded = 0usize;
    loop {
        let next = tokio::select! {
            biased;
            _ = tx.closed() => {
                debug!(forwarded, "receiver dropped; abandoning upstream");
                return;
            }
            next = lines.next() => next,
        };

        let line = match next {
            None => break,
            Some(Ok(line)) => line,
            Some(Err(e)) => {
                let _ = tx.send(Err(e.into())).await;
                return;
            }
        };

        let envelope = match decode_line(&line) {
            Ok(Line::Blank) => continue,
            Ok(Line::Done) => break,
            Ok(Line::Envelope(envelope)) => envelope,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };

        for chunk in chunks_for(&envelope, &model) {
            if tx.send(Ok(chunk)).await.is_err() {
                debug!(forwarded, "receiver dropped; abandoning upstream");
                return;
            }
            forwarded += 1;
        }
    }

    debug!(forwarded, "upstream finished");
    let _ = tx.send(Ok(CompletionChunk::stop(&model))).await;
}

/// SSE response body for a streaming client.
///
/// Emits one frame per chunk and `data: [DONE]` after a clean finish. A
/// translation error becomes a final error frame with no `[DONE]`.
pub fn sse_body(rx: ChunkReceiver) -> impl Stream<Item = Result<Bytes, Infallible>> + Send {
    futures_util::stream::unfold(Some(rx), |state: Option<ChunkReceiver>| async move {
        let Some(mut rx) = state else {
            return None;
        };
        let frame = match rx.recv().await {
            None => return Some((Ok::<_, Infallible>(Bytes::from_static(SSE_DONE)), None)),
            Some(Ok(chunk)) => chunk.to_sse_frame().map_err(|e| RelayError::Internal(e.into())),
            Some(Err(e)) => Err(e),
        };
        match frame {
            Ok(frame) => Some((Ok(Bytes::from(frame)), Some(rx))),
            Err(e) => {
                warn!(error = %e, "stream aborted after headers were sent");
                Some((Ok(Bytes::from(e.to_sse_frame())), None))
            }
        }
    })
}

/// Drain `rx` into one buffered [`Completion`].
///
/// # Errors
/// The first error the translator reported.
pub async fn collect(mut rx: ChunkReceiver, model: &str) -> Result<Completion, RelayError> {
    let mut content = String::new();
    while let Some(chunk) = rx.recv().await {
        content.push_str(chunk?.content());
    }
    Ok(Completion::new(model, content))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use futures_util::{stream, StreamExt};

    type LineItem = Result<String, LinesCodecError>;

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn lines(raw: &[&str]) -> stream::Iter<std::vec::IntoIter<LineItem>> {
        let items: Vec<LineItem> = raw.iter().map(|l| Ok(l.to_string())).collect();
        stream::iter(items)
    }

    async fn run(raw: &[&str]) -> ChunkReceiver {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        translate(lines(raw), "gpt-4o".into(), tx).await;
        rx
    }

    async fn drain(mut rx: ChunkReceiver) -> Vec<Result<CompletionChunk, RelayError>> {
        let mut out = Vec::new();
        while let Some(item) = rx.recv().await {
            out.push(item);
        }
        out
    }

    async fn sse_text(rx: ChunkReceiver) -> String {
        let frames: Vec<Bytes> = sse_body(rx).map(|r| r.unwrap()).collect().await;
        frames
            .iter()
            .map(|b| String::from_utf8(b.to_vec()).unwrap())
            .collect()
    }

    fn sse_payloads(body: &str) -> Vec<&str> {
        body.split("\n\n")
            .filter(|f| !f.is_empty())
            .map(|f| f.strip_prefix("data: ").expect("every frame starts with data:"))
            .collect()
    }

    // -----------------------------------------------------------------------
    // flatten_prompt
    // -----------------------------------------------------------------------

    #[test]
    fn flatten_prompt_labels_roles_and_joins_with_newlines() {
        let messages = vec![
            ChatMessage { role: "system".into(), content: "be brief".into() },
            ChatMessage { role: "user".into(), content: "hi".into() },
            ChatMessage { role: "assistant".into(), content: "hello".into() },
            ChatMessage { role: "user".into(), content: "bye".into() },
        ];
        assert_eq!(
            flatten_prompt(&messages),
            "Assistant: be brief\nUser: hi\nAssistant: hello\nUser: bye"
        );
    }

    #[test]
    fn flatten_prompt_of_empty_conversation_is_empty() {
        assert_eq!(flatten_prompt(&[]), "");
    }

    #[test]
    fn chat_request_stream_defaults_to_false() {
        let req: ChatRequest =
            serde_json::from_str(r#"{"model":"gpt-4o","messages":[]}"#).unwrap();
        assert!(!req.stream);
    }

    // -----------------------------------------------------------------------
    // Chunk shapes
    // -----------------------------------------------------------------------

    #[test]
    fn text_chunk_serializes_in_openai_shape() {
        let chunk = CompletionChunk::text("gpt-4o", "hi");
        let json = serde_json::to_value(&chunk).unwrap();

        assert!(json["id"].as_str().unwrap().starts_with("chatcmpl-"));
        assert_eq!(json["object"], "chat.completion.chunk");
        assert!(json["created"].as_i64().unwrap() > 0);
        assert_eq!(json["model"], "gpt-4o");
        assert_eq!(json["choices"][0]["index"], 0);
        assert_eq!(json["choices"][0]["delta"]["content"], "hi");
        assert_eq!(json["choices"][0]["delta"]["role"], "assistant");
        assert!(json["choices"][0]["finish_reason"].is_null());
        assert!(json.get("usage").unwrap().is_null());
    }

    #[test]
    fn stop_chunk_is_empty_with_stop_reason() {
        let json = serde_json::to_value(CompletionChunk::stop("m")).unwrap();
        assert_eq!(json["choices"][0]["delta"]["content"], "");
        assert_eq!(json["choices"][0]["finish_reason"], "stop");
    }

    #[test]
    fn completion_serializes_in_openai_shape() {
        let json = serde_json::to_value(Completion::new("gpt-4o-mini", "AB".into())).unwrap();
        assert_eq!(json["object"], "chat.completion");
        assert_eq!(json["model"], "gpt-4o-mini");
        assert_eq!(json["choices"][0]["message"]["role"], "assistant");
        assert_eq!(json["choices"][0]["message"]["content"], "AB");
        assert_eq!(json["choices"][0]["finish_reason"], "stop");
        assert!(json["usage"].is_null());
    }

    // -----------------------------------------------------------------------
    // chunks_for
    // -----------------------------------------------------------------------

    #[test]
    fn envelope_with_url_yields_image_then_message() {
        let envelope = Envelope {
            message: "hi".into(),
            url: Some("http://x/img.png".into()),
        };
        let chunks = chunks_for(&envelope, "gpt-4o");

        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].content(), "\n ![](http://x/img.png) \n");
        assert_eq!(chunks[1].content(), "hi");
        assert_ne!(chunks[0].id, chunks[1].id, "every chunk gets a fresh id");
        assert!(chunks.iter().all(|c| c.finish_reason().is_none()));
    }

    #[test]
    fn envelope_without_url_yields_only_message() {
        let envelope = Envelope { message: "plain".into(), url: None };
        let chunks = chunks_for(&envelope, "gpt-4o");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content(), "plain");
        assert_eq!(chunks[0].model, "gpt-4o");
    }

    // -----------------------------------------------------------------------
    // translate
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn translate_emits_chunks_then_stop() {
        let items = drain(
            run(&[r#"{"data":{"message":"A"}}"#, "", r#"{"data":{"message":"B"}}"#, "[DONE]"]).await,
        )
        .await;

        let chunks: Vec<CompletionChunk> = items.into_iter().map(Result::unwrap).collect();
        let contents: Vec<&str> = chunks.iter().map(CompletionChunk::content).collect();
        assert_eq!(contents, vec!["A", "B", ""]);
        assert_eq!(chunks.last().unwrap().finish_reason(), Some(FinishReason::Stop));
    }

    #[tokio::test]
    async fn translate_stops_at_done_marker() {
        let items = drain(
            run(&[r#"{"data":{"message":"A"}}"#, "[DONE]", r#"{"data":{"message":"late"}}"#]).await,
        )
        .await;
        let contents: Vec<String> = items
            .into_iter()
            .map(|c| c.unwrap().content().to_owned())
            .collect();
        assert_eq!(contents, vec!["A", ""]);
    }

    #[tokio::test]
    async fn translate_finishes_on_eof_without_done_marker() {
        let items = drain(run(&[r#"{"data":{"message":"only"}}"#]).await).await;
        assert_eq!(items.len(), 2);
        assert_eq!(
            items[1].as_ref().unwrap().finish_reason(),
            Some(FinishReason::Stop)
        );
    }

    #[tokio::test]
    async fn translate_of_empty_upstream_is_just_stop() {
        let items = drain(run(&[]).await).await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap().content(), "");
    }

    #[tokio::test]
    async fn translate_reports_malformed_line_and_stops() {
        let items = drain(
            run(&[r#"{"data":{"message":"A"}}"#, r#"{"nodata":true}"#, r#"{"data":{"message":"B"}}"#])
                .await,
        )
        .await;

        assert_eq!(items.len(), 2, "no chunks and no stop after an error");
        assert_eq!(items[0].as_ref().unwrap().content(), "A");
        assert!(matches!(items[1], Err(RelayError::MalformedEnvelope(_))));
    }

    #[tokio::test]
    async fn translate_reports_read_errors_as_transport() {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let io = std::io::Error::new(std::io::ErrorKind::TimedOut, "read timed out");
        let upstream = stream::iter(vec![
            Ok(r#"{"data":{"message":"A"}}"#.to_string()),
            Err(LinesCodecError::Io(io)),
        ]);
        translate(upstream, "gpt-4o".into(), tx).await;

        let items = drain(rx).await;
        assert!(matches!(items.last(), Some(Err(RelayError::Transport(_)))));
    }

    #[tokio::test]
    async fn translate_returns_when_receiver_is_dropped_while_upstream_is_idle() {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let upstream = lines(&[r#"{"data":{"message":"A"}}"#]).chain(stream::pending());
        let task = tokio::spawn(translate(upstream, "gpt-4o".into(), tx));

        // Let the first chunk through, then hang up.
        let mut rx = rx;
        assert_eq!(rx.recv().await.unwrap().unwrap().content(), "A");
        drop(rx);

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("translator should notice the closed channel")
            .unwrap();
    }

    // -----------------------------------------------------------------------
    // sse_body & collect
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn sse_body_ends_with_stop_chunk_then_done() {
        let body = sse_text(run(&[r#"{"data":{"message":"hi","url":"http://x/img.png"}}"#]).await).await;
        let payloads = sse_payloads(&body);

        assert_eq!(payloads.len(), 4);
        assert_eq!(*payloads.last().unwrap(), "[DONE]");

        let stop: CompletionChunk = serde_json::from_str(payloads[2]).unwrap();
        assert_eq!(stop.content(), "");
        assert_eq!(stop.finish_reason(), Some(FinishReason::Stop));

        let image: CompletionChunk = serde_json::from_str(payloads[0]).unwrap();
        assert_eq!(image.content(), "\n ![](http://x/img.png) \n");
    }

    #[tokio::test]
    async fn sse_body_ends_with_error_frame_instead_of_done() {
        let body = sse_text(run(&[r#"{"data":{"message":"A"}}"#, "garbage"]).await).await;
        let payloads = sse_payloads(&body);

        assert_eq!(payloads.len(), 2);
        let err: serde_json::Value = serde_json::from_str(payloads[1]).unwrap();
        assert_eq!(err["error"]["type"], "malformed_upstream_response");
        assert!(!body.contains("[DONE]"));
    }

    #[tokio::test]
    async fn collect_concatenates_content() {
        let completion = collect(
            run(&[r#"{"data":{"message":"A"}}"#, r#"{"data":{"message":"B"}}"#, "[DONE]"]).await,
            "gpt-4o",
        )
        .await
        .unwrap();

        assert_eq!(completion.choices[0].message.content, "AB");
        assert_eq!(completion.choices[0].finish_reason, FinishReason::Stop);
        assert_eq!(completion.model, "gpt-4o");
    }

    #[tokio::test]
    async fn collect_propagates_translation_errors() {
        let err = collect(run(&["{not json"]).await, "gpt-4o").await.unwrap_err();
        assert!(matches!(err, RelayError::MalformedEnvelope(_)));
    }

    #[tokio::test]
    async fn streamed_and_buffered_text_agree() {
        let upstream = [
            r#"{"data":{"message":"Here is "}}"#,
            r#"{"data":{"message":"a picture","url":"https://img.example/cat.png"}}"#,
            r#"{"data":{"message":"."}}"#,
            "[DONE]",
        ];

        let body = sse_text(run(&upstream).await).await;
        let streamed: String = sse_payloads(&body)
            .into_iter()
            .filter(|p| *p != "[DONE]")
            .map(|p| serde_json::from_str::<CompletionChunk>(p).unwrap())
            .filter(|c| c.finish_reason().is_none())
            .map(|c| c.content().to_owned())
            .collect();

        let buffered = collect(run(&upstream).await, "gpt-4o").await.unwrap();
        assert_eq!(streamed, buffered.choices[0].message.content);
        assert!(streamed.contains("![](https://img.example/cat.png)"));
    }
}
