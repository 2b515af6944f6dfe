//! SSE parsing for streamed chat completions.
//!
//! The chat API streams `data: {json}` lines terminated by a
//! `data: [DONE]` sentinel. Bytes arrive in arbitrary splits, so a line
//! buffer accumulates until complete lines are available.

use serde::Deserialize;

/// Maximum buffered bytes before the stream is considered malformed.
pub const MAX_LINE_BUFFER: usize = 1_048_576;

/// Accumulates raw bytes and yields complete lines.
#[derive(Debug, Default)]
pub struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes and drain all complete lines.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);

        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line).trim().to_string();
            if !text.is_empty() {
                lines.push(text);
            }
        }
        lines
    }

    /// Whether the buffer has grown past the sanity cap.
    pub fn overflowed(&self) -> bool {
        self.buffer.len() > MAX_LINE_BUFFER
    }
}

/// One parsed SSE event from the completion stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SseEvent {
    /// A text delta extracted from a chunk payload.
    Delta(String),
    /// The `[DONE]` sentinel.
    Done,
    /// A data line that carried no text delta (role header, usage frame).
    Empty,
}

#[derive(Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
#[serde(default)]
struct StreamDelta {
    content: Option<String>,
}

/// Parse a single SSE line. Lines without the `data: ` prefix (comments,
/// event names) yield `None`; unparseable data frames yield `Empty` so a
/// malformed keep-alive cannot kill the stream.
pub fn parse_sse_line(line: &str) -> Option<SseEvent> {
    let data = line.strip_prefix("data:")?.trim();

    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }

    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => {
            let delta = chunk
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.delta.content);
            match delta {
                Some(text) if !text.is_empty() => Some(SseEvent::Delta(text)),
                _ => Some(SseEvent::Empty),
            }
        }
        Err(_) => Some(SseEvent::Empty),
    }
}
