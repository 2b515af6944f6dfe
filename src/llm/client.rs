//! OpenAI-compatible chat completion client.
//!
//! Speaks `/chat/completions` against a configurable base URL, with
//! streaming via SSE and structured output via JSON mode. Upstream errors
//! map onto the transient/permanent split: transient failures (429, 5xx,
//! timeouts) retry with exponential backoff before anything is surfaced
//! to a caller; provider quota errors surface verbatim as
//! `QuotaExceeded`. A streaming call retries establishing the stream, not
//! a stream already interrupted mid-answer.

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::errors::{RagError, Result};
use crate::llm::retry::RetryPolicy;
use crate::llm::stream::{parse_sse_line, SseEvent, SseLineBuffer};
use crate::llm::{ChatMessage, ChatProvider, ChatRequest, DeltaStream};

/// HTTP client for an OpenAI-compatible chat API.
#[derive(Debug, Clone)]
pub struct HttpChatClient {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    retry: RetryPolicy,
}

#[derive(Serialize)]
struct CompletionBody<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
    stream: bool,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct UpstreamErrorBody {
    error: Option<UpstreamErrorDetail>,
}

#[derive(Deserialize)]
struct UpstreamErrorDetail {
    message: Option<String>,
    code: Option<String>,
}

impl HttpChatClient {
    /// Create a client for the given provider endpoint and model.
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Result<Self> {
        let client = Client::builder().build().map_err(RagError::Http)?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            retry: RetryPolicy::new(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn body<'a>(&'a self, request: &'a ChatRequest, stream: bool) -> CompletionBody<'a> {
        CompletionBody {
            model: &self.model,
            messages: &request.messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            response_format: request
                .json_mode
                .then(|| json!({ "type": "json_object" })),
            stream,
        }
    }

    async fn send(&self, request: &ChatRequest, stream: bool) -> Result<reqwest::Response> {
        let url = format!("{}/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .timeout(request.deadline)
            .json(&self.body(request, stream))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RagError::Timeout {
                        secs: request.deadline.as_secs(),
                    }
                } else {
                    RagError::Http(e)
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(Self::map_error(status.as_u16(), &body_text));
        }

        Ok(response)
    }

    /// Map an upstream error response. Quota exhaustion is surfaced
    /// verbatim; everything else goes through the status split.
    fn map_error(status: u16, body: &str) -> RagError {
        if let Ok(parsed) = serde_json::from_str::<UpstreamErrorBody>(body) {
            if let Some(detail) = parsed.error {
                let message = detail.message.unwrap_or_else(|| body.to_string());
                if detail.code.as_deref() == Some("insufficient_quota") {
                    return RagError::QuotaExceeded(message);
                }
                return RagError::from_status(status, message);
            }
        }
        RagError::from_status(status, body.to_string())
    }
}

#[async_trait]
impl ChatProvider for HttpChatClient {
    async fn complete(&self, request: ChatRequest) -> Result<String> {
        self.retry
            .run(|| async {
                let response = self.send(&request, false).await?;

                let completion: CompletionResponse =
                    response.json().await.map_err(RagError::Http)?;
                completion
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.message.content)
                    .ok_or_else(|| {
                        RagError::SchemaViolation("completion had no content".to_string())
                    })
            })
            .await
    }

    async fn complete_stream(&self, request: ChatRequest) -> Result<DeltaStream> {
        let response = self.retry.run(|| self.send(&request, true)).await?;

        let stream = async_stream_deltas(response.bytes_stream());
        Ok(Box::pin(stream))
    }
}

/// Turn a byte stream of SSE frames into a stream of text deltas. Ends at
/// the `[DONE]` sentinel or when the connection closes.
fn async_stream_deltas<S, B>(bytes: S) -> impl futures_util::Stream<Item = Result<String>>
where
    S: futures_util::Stream<Item = std::result::Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]>,
{
    futures_util::stream::unfold(
        (Box::pin(bytes), SseLineBuffer::new(), Vec::<String>::new(), false),
        |(mut bytes, mut buffer, mut pending, mut done)| async move {
            loop {
                if let Some(delta) = pending.pop() {
                    return Some((Ok(delta), (bytes, buffer, pending, done)));
                }
                if done {
                    return None;
                }

                match bytes.next().await {
                    Some(Ok(frame)) => {
                        let lines = buffer.push(frame.as_ref());
                        if buffer.overflowed() {
                            done = true;
                            return Some((
                                Err(RagError::Internal(
                                    "SSE line buffer overflow".to_string(),
                                )),
                                (bytes, buffer, pending, done),
                            ));
                        }
                        // Queue deltas in reverse so pop() preserves order.
                        let mut deltas: Vec<String> = Vec::new();
                        for line in lines {
                            match parse_sse_line(&line) {
                                Some(SseEvent::Delta(text)) => deltas.push(text),
                                Some(SseEvent::Done) => {
                                    done = true;
                                    break;
                                }
                                _ => {}
                            }
                        }
                        deltas.reverse();
                        pending = deltas;
                    }
                    Some(Err(e)) => {
                        done = true;
                        return Some((
                            Err(RagError::TransientUpstream {
                                status: None,
                                message: format!("stream interrupted: {}", e),
                            }),
                            (bytes, buffer, pending, done),
                        ));
                    }
                    None => return None,
                }
            }
        },
    )
}
