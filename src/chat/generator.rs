//! Grounded answer generation with streaming and citations.
//!
//! The prompt carries the tenant persona, today's date, and a numbered
//! context block; the model is instructed to answer only from context and
//! cite `[n]`. After the text stream completes, one `SourceDelta` is
//! emitted per cited chunk (deduplicated, first-citation order), then
//! `End` with the assistant message id.

use chrono::Utc;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::TenantPersona;
use crate::chat::memory::MemoryView;
use crate::errors::Result;
use crate::llm::{ChatMessage, ChatProvider, ChatRequest};
use crate::types::{ChunkId, MessageId, MessageRole, ScoredChunk};

/// Deadline for the generation call.
const GENERATE_DEADLINE: Duration = Duration::from_secs(45);

/// Recent turns included in the prompt.
const HISTORY_TURNS: usize = 8;

/// Citation metadata for one grounded source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRef {
    pub chunk_id: ChunkId,
    pub source: String,
    pub page_number: Option<u32>,
    pub ordinal: usize,
}

/// One element of the generation output stream.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    TextDelta(String),
    SourceDelta(SourceRef),
    End { message_id: MessageId },
}

/// Stream of generation events.
pub type GenerationStream = BoxStream<'static, Result<GenerationEvent>>;

/// Answer generator over the chat provider.
pub struct Generator {
    provider: Arc<dyn ChatProvider>,
}

impl Generator {
    pub fn new(provider: Arc<dyn ChatProvider>) -> Self {
        Self { provider }
    }

    /// Stream a grounded answer. `message_id` is the id the orchestrator
    /// will persist the assistant message under; it is echoed in `End`.
    pub async fn generate(
        &self,
        persona: &TenantPersona,
        query: &str,
        chunks: &[ScoredChunk],
        memory: &MemoryView,
        guidance: Option<&str>,
        message_id: MessageId,
    ) -> Result<GenerationStream> {
        let request = self.build_request(persona, query, chunks, memory, guidance);
        let deltas = self.provider.complete_stream(request).await?;

        let sources: Vec<SourceRef> = chunks
            .iter()
            .map(|scored| SourceRef {
                chunk_id: scored.chunk.chunk_id,
                source: scored.chunk.metadata.source.clone(),
                page_number: scored.chunk.metadata.page_number,
                ordinal: scored.chunk.metadata.ordinal,
            })
            .collect();

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<GenerationEvent>>(64);

        tokio::spawn(async move {
            let mut deltas = deltas;
            let mut full_text = String::new();

            while let Some(delta) = deltas.next().await {
                match delta {
                    Ok(text) => {
                        full_text.push_str(&text);
                        if tx
                            .send(Ok(GenerationEvent::TextDelta(text)))
                            .await
                            .is_err()
                        {
                            // Receiver gone: stop pulling from the model.
                            return;
                        }
                    }
                    Err(e) => {
                        warn!(error = %e, "generation stream failed mid-answer");
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                }
            }

            for index in extract_citations(&full_text, sources.len()) {
                let source = sources[index - 1].clone();
                if tx
                    .send(Ok(GenerationEvent::SourceDelta(source)))
                    .await
                    .is_err()
                {
                    return;
                }
            }

            let _ = tx.send(Ok(GenerationEvent::End { message_id })).await;
        });

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(Box::pin(stream))
    }

    fn build_request(
        &self,
        persona: &TenantPersona,
        query: &str,
        chunks: &[ScoredChunk],
        memory: &MemoryView,
        guidance: Option<&str>,
    ) -> ChatRequest {
        let mut system = String::new();

        system.push_str(&format!(
            "You are the assistant for {}, a {} company in the {:?} industry. \
             Today's date is {}.\n",
            persona.brand_name,
            persona.brand_tone.as_str(),
            persona.industry,
            Utc::now().format("%Y-%m-%d"),
        ));
        if !persona.languages.is_empty() {
            system.push_str(&format!(
                "You may answer in these languages: {}.\n",
                persona.languages.join(", ")
            ));
        }
        if !persona.capabilities.is_empty() {
            system.push_str(&format!(
                "Your capabilities: {}.\n",
                persona.capabilities.join("; ")
            ));
        }
        if !persona.constraints.is_empty() {
            system.push_str(&format!(
                "You must not: {}.\n",
                persona.constraints.join("; ")
            ));
        }
        if let Some(custom) = &persona.custom_instructions {
            system.push_str(custom);
            system.push('\n');
        }

        if chunks.is_empty() {
            system.push_str(
                "\nNo passages from the knowledge base matched this question. If it \
                 asks about specific facts, say plainly that the provided materials \
                 do not cover it; do not invent details.\n",
            );
        } else {
            system.push_str("\nContext passages:\n");
            for (i, scored) in chunks.iter().enumerate() {
                let location = match scored.chunk.metadata.page_number {
                    Some(page) => format!("page {}", page),
                    None => format!("part {}", scored.chunk.metadata.ordinal + 1),
                };
                system.push_str(&format!(
                    "[{}] {} ({})\n{}\n\n",
                    i + 1,
                    scored.chunk.metadata.source,
                    location,
                    scored.chunk.text
                ));
            }
            system.push_str(
                "Answer using only the context passages above. Cite the passages you \
                 use by number, like [1]. If the context does not contain the answer, \
                 say so plainly.\n",
            );
        }

        if let Some(guidance) = guidance {
            system.push_str(&format!("\nResponse guidance: {}\n", guidance));
        }

        if let Some(summary) = &memory.summary {
            system.push_str(&format!("\nConversation so far (summary): {}\n", summary));
        }

        let mut messages = vec![ChatMessage::system(system)];

        // Recent turns, excluding the current user message if memory
        // already holds it (the orchestrator persists before generating).
        let mut recent: Vec<&crate::types::Message> = memory.recent.iter().collect();
        if let Some(last) = recent.last() {
            if last.role == MessageRole::User && last.content == query {
                recent.pop();
            }
        }
        let start = recent.len().saturating_sub(HISTORY_TURNS);
        for message in &recent[start..] {
            messages.push(match message.role {
                MessageRole::User => ChatMessage::user(message.content.clone()),
                MessageRole::Assistant => ChatMessage::assistant(message.content.clone()),
            });
        }
        messages.push(ChatMessage::user(query.to_string()));

        ChatRequest::new(messages)
            .with_max_tokens(1000)
            .with_temperature(0.3)
            .with_deadline(GENERATE_DEADLINE)
    }
}

/// Scan `[n]` citations out of the answer text. Returns 1-based indices
/// in first-citation order, deduplicated; out-of-range ns are dropped.
pub fn extract_citations(text: &str, source_count: usize) -> Vec<usize> {
    let mut seen = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] == b'[' {
            let mut j = i + 1;
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            if j > i + 1 && j < bytes.len() && bytes[j] == b']' {
                if let Ok(n) = text[i + 1..j].parse::<usize>() {
                    if n >= 1 && n <= source_count && !seen.contains(&n) {
                        seen.push(n);
                    }
                }
                i = j + 1;
                continue;
            }
        }
        i += 1;
    }

    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::RagError;
    use crate::llm::DeltaStream;
    use crate::types::{Chunk, ChunkMetadata, DocumentId, TenantId};
    use async_trait::async_trait;

    struct StreamingProvider {
        deltas: Vec<String>,
    }

    #[async_trait]
    impl ChatProvider for StreamingProvider {
        async fn complete(&self, _request: ChatRequest) -> Result<String> {
            Err(RagError::Internal("generator always streams".to_string()))
        }

        async fn complete_stream(&self, _request: ChatRequest) -> Result<DeltaStream> {
            let deltas = self.deltas.clone();
            Ok(Box::pin(futures_util::stream::iter(
                deltas.into_iter().map(Ok),
            )))
        }
    }

    fn scored(ordinal: usize, text: &str) -> ScoredChunk {
        let doc = DocumentId(uuid::Uuid::from_u128(7));
        ScoredChunk {
            chunk: Chunk {
                chunk_id: ChunkId::derive(doc, ordinal),
                document_id: doc,
                tenant_id: TenantId::new(),
                text: text.to_string(),
                token_count: 4,
                metadata: ChunkMetadata {
                    source: "policy.pdf".to_string(),
                    page_number: Some(3),
                    ordinal,
                },
            },
            fused_score: 0.03,
            rerank_score: None,
        }
    }

    #[test]
    fn test_extract_citations_basic() {
        assert_eq!(extract_citations("See [1] and [2].", 5), vec![1, 2]);
    }

    #[test]
    fn test_extract_citations_dedupes_in_order() {
        assert_eq!(extract_citations("[2] then [1] then [2]", 5), vec![2, 1]);
    }

    #[test]
    fn test_extract_citations_drops_out_of_range() {
        assert_eq!(extract_citations("[1] [7] [0]", 3), vec![1]);
    }

    #[test]
    fn test_extract_citations_ignores_non_citations() {
        assert_eq!(extract_citations("array[i] and [notes]", 5), Vec::<usize>::new());
        assert_eq!(extract_citations("[12", 20), Vec::<usize>::new());
    }

    #[tokio::test]
    async fn test_generate_streams_text_sources_end() {
        let provider = Arc::new(StreamingProvider {
            deltas: vec![
                "Refunds last ".to_string(),
                "thirty days [1].".to_string(),
            ],
        });
        let generator = Generator::new(provider);
        let persona = TenantPersona::neutral("Acme");
        let message_id = MessageId::new();
        let chunks = vec![scored(0, "refund policy"), scored(1, "shipping")];

        let mut stream = generator
            .generate(
                &persona,
                "what is the refund policy?",
                &chunks,
                &MemoryView::default(),
                None,
                message_id,
            )
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event.unwrap());
        }

        let text: String = events
            .iter()
            .filter_map(|e| match e {
                GenerationEvent::TextDelta(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "Refunds last thirty days [1].");

        let sources: Vec<&SourceRef> = events
            .iter()
            .filter_map(|e| match e {
                GenerationEvent::SourceDelta(s) => Some(s),
                _ => None,
            })
            .collect();
        assert_eq!(sources.len(), 1);
        assert_eq!(sources[0].chunk_id, chunks[0].chunk.chunk_id);

        assert_eq!(
            events.last().unwrap(),
            &GenerationEvent::End { message_id }
        );
    }

    #[tokio::test]
    async fn test_generate_no_citations_no_sources() {
        let provider = Arc::new(StreamingProvider {
            deltas: vec!["The materials do not cover this.".to_string()],
        });
        let generator = Generator::new(provider);
        let persona = TenantPersona::neutral("Acme");

        let mut stream = generator
            .generate(
                &persona,
                "unknown topic",
                &[],
                &MemoryView::default(),
                None,
                MessageId::new(),
            )
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event.unwrap());
        }

        assert!(events
            .iter()
            .all(|e| !matches!(e, GenerationEvent::SourceDelta(_))));
        assert!(matches!(events.last(), Some(GenerationEvent::End { .. })));
    }

    #[tokio::test]
    async fn test_duplicate_citations_dedupe_sources() {
        let provider = Arc::new(StreamingProvider {
            deltas: vec!["[1] and again [1] plus [2]".to_string()],
        });
        let generator = Generator::new(provider);
        let persona = TenantPersona::neutral("Acme");
        let chunks = vec![scored(0, "a"), scored(1, "b")];

        let mut stream = generator
            .generate(
                &persona,
                "q",
                &chunks,
                &MemoryView::default(),
                None,
                MessageId::new(),
            )
            .await
            .unwrap();

        let mut source_count = 0;
        while let Some(event) = stream.next().await {
            if matches!(event.unwrap(), GenerationEvent::SourceDelta(_)) {
                source_count += 1;
            }
        }
        assert_eq!(source_count, 2);
    }

    #[test]
    fn test_prompt_includes_persona_and_context() {
        let provider = Arc::new(StreamingProvider { deltas: vec![] });
        let generator = Generator::new(provider);
        let mut persona = TenantPersona::neutral("Acme Corp");
        persona.constraints = vec!["give legal advice".to_string()];
        let chunks = vec![scored(0, "refund policy text")];

        let request = generator.build_request(
            &persona,
            "question",
            &chunks,
            &MemoryView::default(),
            None,
        );

        let system = &request.messages[0].content;
        assert!(system.contains("Acme Corp"));
        assert!(system.contains("must not: give legal advice"));
        assert!(system.contains("[1] policy.pdf (page 3)"));
        assert!(system.contains("refund policy text"));
        assert!(system.contains("Today's date is"));
    }

    #[test]
    fn test_prompt_empty_context_instruction() {
        let provider = Arc::new(StreamingProvider { deltas: vec![] });
        let generator = Generator::new(provider);
        let persona = TenantPersona::neutral("Acme");

        let request =
            generator.build_request(&persona, "question", &[], &MemoryView::default(), None);

        assert!(request.messages[0]
            .content
            .contains("provided materials do not cover"));
    }
}
