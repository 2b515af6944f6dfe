//! Batched LLM re-ranking of fused candidates.
//!
//! One JSON-mode chat call scores every candidate on [0, 10]. Any failure
//! (timeout, parse error, missing indices) degrades to the RRF ordering
//! without failing the request.

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::llm::{parse_json_payload, ChatMessage, ChatProvider, ChatRequest};
use crate::types::ScoredChunk;

/// Passage text cap in the re-rank prompt.
const PASSAGE_PREVIEW_CHARS: usize = 500;

/// Deadline for the single re-rank call.
const RERANK_DEADLINE: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
struct RerankResponse {
    scores: Vec<RerankScore>,
}

#[derive(Debug, Deserialize)]
struct RerankScore {
    /// 1-based index into the candidate list.
    index: usize,
    /// Relevance on [0, 10].
    score: f64,
}

/// Model-based re-ranker over a fused candidate list.
pub struct LlmReranker {
    provider: Arc<dyn ChatProvider>,
}

impl LlmReranker {
    pub fn new(provider: Arc<dyn ChatProvider>) -> Self {
        Self { provider }
    }

    /// Score and reorder candidates. Ties and unscored candidates keep
    /// their RRF order (stable sort); on any upstream or schema failure
    /// the input order is returned untouched.
    pub async fn rerank(&self, query: &str, mut candidates: Vec<ScoredChunk>) -> Vec<ScoredChunk> {
        if candidates.len() < 2 {
            return candidates;
        }

        let request = self.build_request(query, &candidates);
        let raw = match self.provider.complete(request).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "re-rank call failed, keeping RRF order");
                return candidates;
            }
        };

        let response: RerankResponse = match parse_json_payload(&raw) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "re-rank output unparseable, keeping RRF order");
                return candidates;
            }
        };

        let mut scored = 0usize;
        for entry in response.scores {
            if entry.index >= 1 && entry.index <= candidates.len() {
                candidates[entry.index - 1].rerank_score = Some(entry.score.clamp(0.0, 10.0));
                scored += 1;
            }
        }
        debug!(candidates = candidates.len(), scored, "re-rank applied");

        // Stable sort: candidates the model skipped keep their fused-score
        // position relative to each other.
        candidates.sort_by(|a, b| {
            b.effective_score()
                .partial_cmp(&a.effective_score())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        candidates
    }

    fn build_request(&self, query: &str, candidates: &[ScoredChunk]) -> ChatRequest {
        let passages = candidates
            .iter()
            .enumerate()
            .map(|(i, candidate)| {
                let text: String = candidate
                    .chunk
                    .text
                    .chars()
                    .take(PASSAGE_PREVIEW_CHARS)
                    .collect();
                format!("[{}] {}", i + 1, text)
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        let system = "You score passages for relevance to a query. \
            Respond with JSON only: {\"scores\": [{\"index\": <1-based passage number>, \
            \"score\": <integer 0-10>}]}. Score every passage.";

        let user = format!("Query: {}\n\nPassages:\n{}", query, passages);

        ChatRequest::new(vec![ChatMessage::system(system), ChatMessage::user(user)])
            .with_json_mode()
            .with_temperature(0.0)
            .with_max_tokens(1000)
            .with_deadline(RERANK_DEADLINE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{RagError, Result};
    use crate::llm::DeltaStream;
    use crate::types::{Chunk, ChunkId, ChunkMetadata, DocumentId, TenantId};
    use async_trait::async_trait;

    struct ScriptedProvider {
        response: Result<String>,
    }

    #[async_trait]
    impl ChatProvider for ScriptedProvider {
        async fn complete(&self, _request: ChatRequest) -> Result<String> {
            match &self.response {
                Ok(s) => Ok(s.clone()),
                Err(_) => Err(RagError::from_status(500, "scripted failure")),
            }
        }

        async fn complete_stream(&self, _request: ChatRequest) -> Result<DeltaStream> {
            unimplemented!("re-ranker never streams")
        }
    }

    fn candidate(ordinal: usize, fused: f64) -> ScoredChunk {
        let doc = DocumentId(uuid::Uuid::from_u128(42));
        ScoredChunk {
            chunk: Chunk {
                chunk_id: ChunkId::derive(doc, ordinal),
                document_id: doc,
                tenant_id: TenantId::new(),
                text: format!("passage {}", ordinal),
                token_count: 2,
                metadata: ChunkMetadata {
                    source: "doc.txt".to_string(),
                    page_number: None,
                    ordinal,
                },
            },
            fused_score: fused,
            rerank_score: None,
        }
    }

    #[tokio::test]
    async fn test_rerank_reorders_by_score() {
        let provider = Arc::new(ScriptedProvider {
            response: Ok(r#"{"scores": [{"index": 1, "score": 2}, {"index": 2, "score": 9}]}"#
                .to_string()),
        });
        let reranker = LlmReranker::new(provider);

        let ranked = reranker
            .rerank("query", vec![candidate(0, 0.9), candidate(1, 0.5)])
            .await;

        assert_eq!(ranked[0].chunk.metadata.ordinal, 1);
        assert_eq!(ranked[0].rerank_score, Some(9.0));
        assert_eq!(ranked[1].rerank_score, Some(2.0));
    }

    #[tokio::test]
    async fn test_upstream_failure_keeps_rrf_order() {
        let provider = Arc::new(ScriptedProvider {
            response: Err(RagError::Internal("unused".to_string())),
        });
        let reranker = LlmReranker::new(provider);

        let ranked = reranker
            .rerank("query", vec![candidate(0, 0.9), candidate(1, 0.5)])
            .await;

        assert_eq!(ranked[0].chunk.metadata.ordinal, 0);
        assert!(ranked.iter().all(|c| c.rerank_score.is_none()));
    }

    #[tokio::test]
    async fn test_invalid_json_keeps_rrf_order() {
        let provider = Arc::new(ScriptedProvider {
            response: Ok("not json at all".to_string()),
        });
        let reranker = LlmReranker::new(provider);

        let ranked = reranker
            .rerank("query", vec![candidate(0, 0.9), candidate(1, 0.5)])
            .await;

        assert_eq!(ranked[0].chunk.metadata.ordinal, 0);
        assert_eq!(ranked[1].chunk.metadata.ordinal, 1);
    }

    #[tokio::test]
    async fn test_out_of_range_indices_ignored() {
        let provider = Arc::new(ScriptedProvider {
            response: Ok(
                r#"{"scores": [{"index": 0, "score": 10}, {"index": 99, "score": 10}, {"index": 2, "score": 7}]}"#
                    .to_string(),
            ),
        });
        let reranker = LlmReranker::new(provider);

        let ranked = reranker
            .rerank("query", vec![candidate(0, 0.9), candidate(1, 0.5)])
            .await;

        // Only index 2 was valid; it outranks the unscored candidate.
        assert_eq!(ranked[0].rerank_score, Some(7.0));
        assert!(ranked[1].rerank_score.is_none());
    }

    #[tokio::test]
    async fn test_scores_clamped() {
        let provider = Arc::new(ScriptedProvider {
            response: Ok(r#"{"scores": [{"index": 1, "score": 99}, {"index": 2, "score": -3}]}"#
                .to_string()),
        });
        let reranker = LlmReranker::new(provider);

        let ranked = reranker
            .rerank("query", vec![candidate(0, 0.9), candidate(1, 0.5)])
            .await;

        assert_eq!(ranked[0].rerank_score, Some(10.0));
        assert_eq!(ranked[1].rerank_score, Some(0.0));
    }

    #[tokio::test]
    async fn test_single_candidate_skips_call() {
        let provider = Arc::new(ScriptedProvider {
            response: Err(RagError::Internal("must not be called".to_string())),
        });
        let reranker = LlmReranker::new(provider);

        let ranked = reranker.rerank("query", vec![candidate(0, 0.9)]).await;
        assert_eq!(ranked.len(), 1);
    }
}
