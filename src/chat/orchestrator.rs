//! End-to-end chat turn pipeline.
//!
//! One turn: persist the user message, load memory, classify, retrieve
//! (with a single expansion retry on zero results), stream the generated
//! answer to the caller while collecting it, and persist the assistant
//! message. Turns are serialised per session; a client disconnect cancels
//! generation promptly but what was already streamed is still persisted
//! within a bounded grace period.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chat::expansion::QueryExpander;
use crate::chat::generator::{extract_citations, GenerationEvent, GenerationStream, Generator};
use crate::chat::memory::ConversationMemory;
use crate::chat::planner::{PlanDecision, Planner};
use crate::config::TenantPersona;
use crate::errors::{RagError, Result};
use crate::retrieve::HybridRetriever;
use crate::session::SessionStore;
use crate::types::{
    Message, MessageId, MessageRole, RetrievalMetadata, ScoredChunk, SessionId, TenantId,
};

use futures_util::StreamExt;

/// Orchestrator knobs.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Retrieval retries with query expansion on zero results.
    pub max_retries: usize,
    pub enable_query_expansion: bool,
    /// Budget for planning plus retrieval within one turn.
    pub turn_deadline: Duration,
    /// Persistence window after a client disconnect.
    pub persist_grace: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            enable_query_expansion: true,
            turn_deadline: Duration::from_secs(60),
            persist_grace: Duration::from_secs(5),
        }
    }
}

/// Lifecycle of one chat turn. `Failed` is reachable from every state;
/// retrieval is skipped for turns that need no context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Received,
    Planning,
    Retrieving,
    Generating,
    Persisting,
    Done,
    Failed,
}

impl TurnState {
    pub fn can_transition(self, to: TurnState) -> bool {
        use TurnState::*;
        matches!(
            (self, to),
            (Received, Planning)
                | (Planning, Retrieving)
                | (Planning, Generating)
                | (Retrieving, Generating)
                | (Generating, Persisting)
                | (Persisting, Done)
                | (_, Failed)
        )
    }
}

/// Per-turn progress tracker with a correlation id for the logs.
struct Turn {
    id: Uuid,
    state: TurnState,
}

impl Turn {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            state: TurnState::Received,
        }
    }

    fn advance(&mut self, to: TurnState) {
        debug_assert!(
            self.state.can_transition(to),
            "invalid turn transition {:?} -> {:?}",
            self.state,
            to
        );
        debug!(turn_id = %self.id, from = ?self.state, to = ?to, "turn state");
        self.state = to;
    }
}

/// Chat pipeline coordinator.
pub struct ChatOrchestrator {
    planner: Planner,
    expander: QueryExpander,
    memory: Arc<ConversationMemory>,
    retriever: Arc<HybridRetriever>,
    generator: Arc<Generator>,
    sessions: Arc<dyn SessionStore>,
    turn_locks: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>,
    config: OrchestratorConfig,
}

impl ChatOrchestrator {
    pub fn new(
        planner: Planner,
        expander: QueryExpander,
        memory: Arc<ConversationMemory>,
        retriever: Arc<HybridRetriever>,
        generator: Arc<Generator>,
        sessions: Arc<dyn SessionStore>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            planner,
            expander,
            memory,
            retriever,
            generator,
            sessions,
            turn_locks: Mutex::new(HashMap::new()),
            config,
        }
    }

    fn turn_lock(&self, session_id: SessionId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.turn_locks.lock().unwrap();
        locks.entry(session_id).or_default().clone()
    }

    /// Run one chat turn, returning the event stream. A second message
    /// for the same session waits until this turn finishes persisting.
    pub async fn chat(
        &self,
        tenant_id: TenantId,
        session_id: SessionId,
        user_text: &str,
        persona: &TenantPersona,
    ) -> Result<GenerationStream> {
        let mut turn = Turn::new();
        let turn_id = turn.id;

        // Session must exist and belong to the tenant; anything else
        // fails closed.
        if self
            .sessions
            .get_session(tenant_id, session_id)
            .await?
            .is_none()
        {
            error!(turn_id = %turn_id, %tenant_id, %session_id, "session not owned by tenant");
            return Err(RagError::TenantScope(format!(
                "session not found for tenant (correlation {})",
                turn_id
            )));
        }

        let guard = self.turn_lock(session_id).lock_owned().await;

        info!(turn_id = %turn_id, %tenant_id, %session_id, "chat turn accepted");

        self.memory
            .append(Message::user(session_id, tenant_id, user_text))
            .await
            .map_err(|e| self.sanitize(e, turn_id))?;

        let view = self
            .memory
            .load(tenant_id, session_id)
            .await
            .map_err(|e| self.sanitize(e, turn_id))?;

        // Planning and retrieval share the turn deadline; expiry falls
        // back to the empty-context path instead of failing the turn.
        turn.advance(TurnState::Planning);
        let staged = tokio::time::timeout(self.config.turn_deadline, async {
            let decision = self.planner.classify_and_rewrite(user_text, &view).await;

            let (chunks, guidance) = match &decision {
                PlanDecision::Greeting { guidance } => (Vec::new(), Some(guidance.clone())),
                PlanDecision::Chitchat => (Vec::new(), None),
                decision => {
                    let query = decision
                        .retrieval_query()
                        .expect("knowledge decisions carry a query");
                    (self.retrieve_with_retry(tenant_id, query).await, None)
                }
            };
            (decision, chunks, guidance)
        })
        .await;

        let (decision, chunks, guidance) = match staged {
            Ok(staged) => staged,
            Err(_) => {
                warn!(turn_id = %turn_id, "turn deadline expired during planning/retrieval");
                (
                    PlanDecision::Fallback {
                        query: user_text.to_string(),
                    },
                    Vec::new(),
                    None,
                )
            }
        };

        if decision.retrieval_query().is_some() {
            turn.advance(TurnState::Retrieving);
        }
        info!(
            turn_id = %turn_id,
            ?decision,
            chunks = chunks.len(),
            "turn planned"
        );

        turn.advance(TurnState::Generating);
        let message_id = MessageId::new();
        let generation = self
            .generator
            .generate(persona, user_text, &chunks, &view, guidance.as_deref(), message_id)
            .await
            .map_err(|e| self.sanitize(e, turn_id))?;

        Ok(self.tee(
            turn,
            guard,
            generation,
            chunks,
            tenant_id,
            session_id,
            message_id,
        ))
    }

    /// Retrieval with the zero-result expansion retry. Errors degrade to
    /// the empty-context path; tenant-scope violations stay fail-closed.
    async fn retrieve_with_retry(&self, tenant_id: TenantId, query: &str) -> Vec<ScoredChunk> {
        let chunks = match self.retriever.retrieve(tenant_id, query).await {
            Ok(chunks) => chunks,
            Err(e) => {
                error!(error = %e, kind = e.kind(), "retrieval failed, answering without context");
                return Vec::new();
            }
        };
        if !chunks.is_empty() {
            return chunks;
        }

        if !self.config.enable_query_expansion || self.config.max_retries == 0 {
            return chunks;
        }

        for attempt in 1..=self.config.max_retries {
            debug!(attempt, query, "zero results, retrying with expansion");
            let paraphrases = self.expander.expand(query).await;
            match self
                .retriever
                .retrieve_union(tenant_id, query, &paraphrases)
                .await
            {
                Ok(expanded) if !expanded.is_empty() => return expanded,
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, kind = e.kind(), "expansion retrieval failed");
                    return Vec::new();
                }
            }
        }

        Vec::new()
    }

    /// Forward generation events to the caller while collecting the
    /// answer; persist the assistant message when the stream ends or the
    /// caller disconnects.
    #[allow(clippy::too_many_arguments)]
    fn tee(
        &self,
        mut turn: Turn,
        guard: tokio::sync::OwnedMutexGuard<()>,
        mut generation: GenerationStream,
        chunks: Vec<ScoredChunk>,
        tenant_id: TenantId,
        session_id: SessionId,
        message_id: MessageId,
    ) -> GenerationStream {
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<GenerationEvent>>(64);
        let memory = self.memory.clone();
        let persist_grace = self.config.persist_grace;

        tokio::spawn(async move {
            let _guard = guard;
            let turn_id = turn.id;
            let mut delivered = String::new();
            let mut cancelled = false;
            let mut failed = false;

            while let Some(event) = generation.next().await {
                match event {
                    Ok(GenerationEvent::TextDelta(text)) => {
                        if tx
                            .send(Ok(GenerationEvent::TextDelta(text.clone())))
                            .await
                            .is_err()
                        {
                            // Client gone: cancel generation promptly by
                            // dropping the stream, keep what was delivered.
                            cancelled = true;
                            break;
                        }
                        delivered.push_str(&text);
                    }
                    Ok(GenerationEvent::SourceDelta(source)) => {
                        if tx
                            .send(Ok(GenerationEvent::SourceDelta(source)))
                            .await
                            .is_err()
                        {
                            cancelled = true;
                            break;
                        }
                    }
                    Ok(GenerationEvent::End { .. }) => break,
                    Err(e) => {
                        error!(turn_id = %turn_id, error = %e, "generation failed mid-stream");
                        failed = true;
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
            drop(generation);

            if failed && delivered.is_empty() {
                turn.advance(TurnState::Failed);
                return;
            }

            turn.advance(TurnState::Persisting);
            let cited: Vec<_> = extract_citations(&delivered, chunks.len())
                .into_iter()
                .map(|n| chunks[n - 1].chunk.chunk_id)
                .collect();

            let assistant = Message {
                message_id,
                session_id,
                tenant_id,
                role: MessageRole::Assistant,
                content: delivered,
                created_at: chrono::Utc::now(),
                retrieval_metadata: Some(RetrievalMetadata { chunk_ids: cited }),
            };

            let persisted =
                tokio::time::timeout(persist_grace, memory.persist(assistant)).await;
            match persisted {
                Ok(Ok(())) => {
                    turn.advance(TurnState::Done);
                    info!(turn_id = %turn_id, cancelled, "turn complete");
                    // Summarisation runs off the critical path; the next
                    // turn does not wait for it.
                    let memory = memory.clone();
                    tokio::spawn(async move {
                        memory.compact(tenant_id, session_id).await;
                    });
                }
                Ok(Err(e)) => {
                    turn.advance(TurnState::Failed);
                    error!(turn_id = %turn_id, error = %e, "failed to persist assistant message");
                }
                Err(_) => {
                    turn.advance(TurnState::Failed);
                    error!(turn_id = %turn_id, "assistant persistence exceeded grace period");
                }
            }

            if !cancelled && !failed {
                let _ = tx.send(Ok(GenerationEvent::End { message_id })).await;
            }
        });

        Box::pin(futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        }))
    }

    /// Detailed cause goes to the logs under the correlation id; the
    /// caller sees only the sanitised class.
    fn sanitize(&self, e: RagError, turn_id: Uuid) -> RagError {
        error!(turn_id = %turn_id, error = %e, kind = e.kind(), "chat turn failed");
        RagError::Internal(format!(
            "chat turn failed: {} (correlation {})",
            e.kind(),
            turn_id
        ))
    }
}
