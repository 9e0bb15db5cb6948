//! Decoding of the upstream's line-delimited response body.
//!
//! Each non-empty line is a JSON envelope of the form
//! `{"data": {"message": "...", "url": "..."}}`, where `url` is optional and
//! points at a generated image. A bare `[DONE]` line ends the stream.

use serde::Deserialize;

use crate::error::RelayError;

/// Literal line the upstream sends after its last envelope.
pub const DONE_MARKER: &str = "[DONE]";

/// One decoded upstream envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub message: String,
    pub url: Option<String>,
}

/// Classification of a single upstream line.
#[derive(Debug, PartialEq, Eq)]
pub enum Line {
    /// Blank keep-alive line.
    Blank,
    /// End-of-stream marker.
    Done,
    Envelope(Envelope),
}

#[derive(Deserialize)]
struct RawEnvelope {
    data: Option<RawData>,
}

#[derive(Deserialize)]
struct RawData {
    message: Option<String>,
    url: Option<String>,
}

/// Decode one line of upstream output.
///
/// # Errors
/// Returns [`RelayError::MalformedEnvelope`] when the line is not JSON, or
/// when `data` or `data.message` is missing.
pub fn decode_line(line: &str) -> Result<Line, RelayError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Line::Blank);
    }
    if line == DONE_MARKER {
        return Ok(Line::Done);
    }

    let raw: RawEnvelope = serde_json::from_str(line)
        .map_err(|e| RelayError::MalformedEnvelope(format!("{e}: {}", preview(line))))?;
    let data = raw
        .data
        .ok_or_else(|| RelayError::MalformedEnvelope(format!("missing `data`: {}", preview(line))))?;
    let message = data.message.ok_or_else(|| {
        RelayError::MalformedEnvelope(format!("missing `data.message`: {}", preview(line)))
    })?;

    Ok(Line::Envelope(Envelope {
        message,
        url: data.url,
    }))
}

fn preview(line: &str) -> String {
    const MAX: usize = 120;
    match line.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}…", &line[..idx]),
        None => line.to_owned(),
    }
}
