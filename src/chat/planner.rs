//! Intent classification and query rewriting.
//!
//! One JSON-mode chat call decides whether the turn needs retrieval and
//! resolves anaphora against the conversation memory. Any failure
//! defaults to `Knowledge` with the original query so a broken classifier
//! can never block answers.

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::chat::memory::MemoryView;
use crate::llm::{parse_json_payload, ChatMessage, ChatProvider, ChatRequest};
use crate::types::MessageRole;

/// Deadline for the classification call.
const PLAN_DEADLINE: Duration = Duration::from_secs(10);

/// Recent turns shown to the classifier for anaphora resolution.
const PLAN_CONTEXT_TURNS: usize = 6;

/// What the orchestrator does with the turn.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanDecision {
    /// Trivial social exchange; no retrieval. Carries response guidance
    /// for the generator.
    Greeting { guidance: String },
    /// General conversation; no retrieval.
    Chitchat,
    /// Needs retrieval, with anaphora resolved against memory.
    Knowledge { rewritten_query: String },
    /// Ambiguous; treated as knowledge with the original query.
    Fallback { query: String },
}

impl PlanDecision {
    /// The retrieval query, when the decision calls for retrieval.
    pub fn retrieval_query(&self) -> Option<&str> {
        match self {
            PlanDecision::Knowledge { rewritten_query } => Some(rewritten_query),
            PlanDecision::Fallback { query } => Some(query),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PlanResponse {
    intent: String,
    #[serde(default)]
    rewritten_query: Option<String>,
    #[serde(default)]
    guidance: Option<String>,
}

/// Intent classifier and query rewriter.
pub struct Planner {
    provider: Arc<dyn ChatProvider>,
}

impl Planner {
    pub fn new(provider: Arc<dyn ChatProvider>) -> Self {
        Self { provider }
    }

    /// Classify the user turn. Never fails: parse or upstream errors
    /// default to `Knowledge` with the original query.
    pub async fn classify_and_rewrite(&self, query: &str, memory: &MemoryView) -> PlanDecision {
        let request = self.build_request(query, memory);

        let raw = match self.provider.complete(request).await {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "planner call failed, defaulting to knowledge");
                return PlanDecision::Knowledge {
                    rewritten_query: query.to_string(),
                };
            }
        };

        let response: PlanResponse = match parse_json_payload(&raw) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "planner output unparseable, defaulting to knowledge");
                return PlanDecision::Knowledge {
                    rewritten_query: query.to_string(),
                };
            }
        };

        let decision = match response.intent.as_str() {
            "greeting" => PlanDecision::Greeting {
                guidance: response
                    .guidance
                    .unwrap_or_else(|| "Reply with a brief, warm greeting.".to_string()),
            },
            "chitchat" => PlanDecision::Chitchat,
            "knowledge" => PlanDecision::Knowledge {
                rewritten_query: response
                    .rewritten_query
                    .filter(|q| !q.trim().is_empty())
                    .unwrap_or_else(|| query.to_string()),
            },
            _ => PlanDecision::Fallback {
                query: query.to_string(),
            },
        };

        debug!(?decision, "turn classified");
        decision
    }

    fn build_request(&self, query: &str, memory: &MemoryView) -> ChatRequest {
        let system = "You classify a user message for a document-grounded assistant. \
            Respond with JSON only: {\"intent\": \"greeting\"|\"chitchat\"|\"knowledge\"|\"fallback\", \
            \"rewritten_query\": <string>, \"guidance\": <string>}. \
            For \"knowledge\", rewrite the message as a self-contained query: resolve \
            pronouns and references like \"the second one\" using the conversation. \
            For \"greeting\", put a one-line response suggestion in \"guidance\".";

        let mut context = String::new();
        if let Some(summary) = &memory.summary {
            context.push_str("Conversation summary:\n");
            context.push_str(summary);
            context.push_str("\n\n");
        }
        let recent_start = memory.recent.len().saturating_sub(PLAN_CONTEXT_TURNS);
        if recent_start < memory.recent.len() {
            context.push_str("Recent turns:\n");
            for message in &memory.recent[recent_start..] {
                let role = match message.role {
                    MessageRole::User => "user",
                    MessageRole::Assistant => "assistant",
                };
                context.push_str(&format!("{}: {}\n", role, message.content));
            }
            context.push('\n');
        }

        let user = format!("{}Message to classify: {}", context, query);

        ChatRequest::new(vec![ChatMessage::system(system), ChatMessage::user(user)])
            .with_json_mode()
            .with_temperature(0.0)
            .with_max_tokens(300)
            .with_deadline(PLAN_DEADLINE)
    }
}
