//! Query expansion for the zero-result retry.
//!
//! One JSON-mode chat call produces a handful of paraphrases that vary
//! wording while keeping intent, so a corpus that says "guarantee" can
//! answer a question about "warranty". Failures fall back to the original
//! query alone.

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::llm::{parse_json_payload, ChatMessage, ChatProvider, ChatRequest};

/// Paraphrase count bounds.
const MIN_PARAPHRASES: usize = 2;
const MAX_PARAPHRASES: usize = 3;

/// Deadline for the expansion call.
const EXPAND_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct ExpansionResponse {
    paraphrases: Vec<String>,
}

/// Paraphrase generator for retrieval retries.
pub struct QueryExpander {
    provider: Arc<dyn ChatProvider>,
}

impl QueryExpander {
    pub fn new(provider: Arc<dyn ChatProvider>) -> Self {
        Self { provider }
    }

    /// Produce 2-3 paraphrases of `query`. The original query is always
    /// included first; on any failure it is all that is returned.
    pub async fn expand(&self, query: &str) -> Vec<String> {
        let system = format!(
            "You rephrase search queries to improve recall over a private document \
             corpus. Produce {} to {} alternative phrasings using synonyms and \
             related terms, keeping the original intent. Respond with JSON only: \
             {{\"paraphrases\": [<string>, ...]}}.",
            MIN_PARAPHRASES, MAX_PARAPHRASES
        );
        let request = ChatRequest::new(vec![
            ChatMessage::system(system),
            ChatMessage::user(format!("Query: {}", query)),
        ])
        .with_json_mode()
        .with_temperature(0.5)
        .with_max_tokens(300)
        .with_deadline(EXPAND_DEADLINE);

        let mut queries = vec![query.to_string()];

        let raw = match self.provider.complete(request).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "query expansion failed, retrying with original only");
                return queries;
            }
        };

        match parse_json_payload::<ExpansionResponse>(&raw) {
            Ok(response) => {
                for paraphrase in response.paraphrases.into_iter().take(MAX_PARAPHRASES) {
                    let trimmed = paraphrase.trim();
                    if !trimmed.is_empty() && !queries.iter().any(|q| q == trimmed) {
                        queries.push(trimmed.to_string());
                    }
                }
                debug!(count = queries.len() - 1, "query expanded");
            }
            Err(e) => {
                warn!(error = %e, "expansion output unparseable, retrying with original only");
            }
        }

        queries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{RagError, Result};
    use crate::llm::DeltaStream;
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
            unimplemented!("expander never streams")
        }
    }

    #[tokio::test]
    async fn test_expansion_includes_original_first() {
        let expander = QueryExpander::new(Arc::new(ScriptedProvider {
            response: Ok(
                r#"{"paraphrases": ["guarantee terms", "product guarantee coverage"]}"#
                    .to_string(),
            ),
        }));

        let queries = expander.expand("warranty").await;
        assert_eq!(queries[0], "warranty");
        assert_eq!(queries.len(), 3);
        assert!(queries.contains(&"guarantee terms".to_string()));
    }

    #[tokio::test]
    async fn test_expansion_caps_paraphrases() {
        let expander = QueryExpander::new(Arc::new(ScriptedProvider {
            response: Ok(r#"{"paraphrases": ["a", "b", "c", "d", "e"]}"#.to_string()),
        }));

        let queries = expander.expand("q").await;
        // Original + at most three paraphrases.
        assert!(queries.len() <= 1 + MAX_PARAPHRASES);
    }

    #[tokio::test]
    async fn test_expansion_failure_returns_original() {
        let expander = QueryExpander::new(Arc::new(ScriptedProvider {
            response: Err(RagError::Internal("down".to_string())),
        }));

        let queries = expander.expand("warranty").await;
        assert_eq!(queries, vec!["warranty".to_string()]);
    }

    #[tokio::test]
    async fn test_expansion_dedupes_and_drops_blank() {
        let expander = QueryExpander::new(Arc::new(ScriptedProvider {
            response: Ok(r#"{"paraphrases": ["warranty", "  ", "guarantee"]}"#.to_string()),
        }));

        let queries = expander.expand("warranty").await;
        assert_eq!(
            queries,
            vec!["warranty".to_string(), "guarantee".to_string()]
        );
    }
}
