//! Conversation memory: verbatim window plus rolling LLM summary.
//!
//! The newest `window` messages stay verbatim; older history is folded
//! into a summary by a dedicated chat call. A failed compression never
//! loses messages: the window simply grows until the next append retries.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::llm::{ChatMessage, ChatProvider, ChatRequest};
use crate::session::SessionStore;
use crate::types::{MemorySummary, Message, MessageRole, SessionId, TenantId};

/// Deadline for one summarisation call.
const SUMMARY_DEADLINE: Duration = Duration::from_secs(20);

/// What the planner and generator see for a session.
#[derive(Debug, Clone, Default)]
pub struct MemoryView {
    pub summary: Option<String>,
    pub recent: Vec<Message>,
}

/// Rolling conversation memory over the session store.
pub struct ConversationMemory {
    store: Arc<dyn SessionStore>,
    provider: Arc<dyn ChatProvider>,
    window: usize,
    summary_max_tokens: u32,
    summaries: RwLock<HashMap<SessionId, SummaryState>>,
    locks: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>,
}

#[derive(Debug, Clone)]
struct SummaryState {
    summary: MemorySummary,
    /// Messages [0, compressed_count) are folded into the summary.
    compressed_count: usize,
}

impl ConversationMemory {
    pub fn new(
        store: Arc<dyn SessionStore>,
        provider: Arc<dyn ChatProvider>,
        window: usize,
        summary_max_tokens: u32,
    ) -> Self {
        Self {
            store,
            provider,
            window: window.max(1),
            summary_max_tokens,
            summaries: RwLock::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn session_lock(&self, session_id: SessionId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks.entry(session_id).or_default().clone()
    }

    /// Load the current view: summary (if any) plus the uncompressed tail
    /// of the history. When compression is keeping up, the tail holds at
    /// most `window` messages.
    pub async fn load(&self, tenant_id: TenantId, session_id: SessionId) -> Result<MemoryView> {
        let messages = self.store.messages(tenant_id, session_id).await?;
        let state = self.summaries.read().unwrap().get(&session_id).cloned();

        match state {
            Some(state) => {
                let start = state.compressed_count.min(messages.len());
                Ok(MemoryView {
                    summary: Some(state.summary.summary_text),
                    recent: messages[start..].to_vec(),
                })
            }
            None => Ok(MemoryView {
                summary: None,
                recent: messages,
            }),
        }
    }

    /// Persist a message, then compress any history that has slid past
    /// the verbatim window.
    pub async fn append(&self, message: Message) -> Result<()> {
        let session_id = message.session_id;
        let tenant_id = message.tenant_id;

        self.persist(message).await?;
        self.compact(tenant_id, session_id).await;
        Ok(())
    }

    /// Persist a message without driving compression. Callers on a
    /// latency budget use this and run [`compact`](Self::compact) off the
    /// critical path.
    pub async fn persist(&self, message: Message) -> Result<()> {
        let lock = self.session_lock(message.session_id);
        let _guard = lock.lock().await;
        self.store.append_message(message).await
    }

    /// Compress any history that has slid past the verbatim window.
    pub async fn compact(&self, tenant_id: TenantId, session_id: SessionId) {
        let lock = self.session_lock(session_id);
        let _guard = lock.lock().await;
        self.compress_overflow(tenant_id, session_id).await;
    }

    /// Fold messages beyond the window into the summary. Failures leave
    /// everything uncompressed; the next append tries again.
    async fn compress_overflow(&self, tenant_id: TenantId, session_id: SessionId) {
        let messages = match self.store.messages(tenant_id, session_id).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!(%session_id, error = %e, "could not load history for compression");
                return;
            }
        };

        let compressed_count = self
            .summaries
            .read()
            .unwrap()
            .get(&session_id)
            .map(|s| s.compressed_count)
            .unwrap_or(0);

        let uncompressed = messages.len().saturating_sub(compressed_count);
        if uncompressed <= self.window {
            return;
        }

        let fold_until = messages.len() - self.window;
        let to_fold = &messages[compressed_count..fold_until];
        let existing = self
            .summaries
            .read()
            .unwrap()
            .get(&session_id)
            .map(|s| s.summary.summary_text.clone());

        match self.summarise(existing.as_deref(), to_fold).await {
            Ok(summary_text) => {
                let up_to = to_fold
                    .last()
                    .map(|m| m.message_id)
                    .expect("fold slice is non-empty");
                debug!(
                    %session_id,
                    folded = to_fold.len(),
                    "conversation history compressed"
                );
                self.summaries.write().unwrap().insert(
                    session_id,
                    SummaryState {
                        summary: MemorySummary {
                            session_id,
                            tenant_id,
                            summary_text,
                            up_to_message_id: up_to,
                        },
                        compressed_count: fold_until,
                    },
                );
            }
            Err(e) => {
                // Messages stay verbatim; nothing is lost.
                warn!(%session_id, error = %e, "history compression failed, window grows");
            }
        }
    }

    async fn summarise(&self, existing: Option<&str>, messages: &[Message]) -> Result<String> {
        let system = format!(
            "You maintain a running summary of a support conversation. Merge the \
             prior summary (if given) with the new messages into one summary of at \
             most {} tokens. Preserve user intents, stated preferences, named \
             entities, and unresolved questions. Drop greetings and pleasantries.",
            self.summary_max_tokens
        );

        let mut body = String::new();
        if let Some(existing) = existing {
            body.push_str("Prior summary:\n");
            body.push_str(existing);
            body.push_str("\n\n");
        }
        body.push_str("New messages:\n");
        for message in messages {
            let role = match message.role {
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
            };
            body.push_str(&format!("{}: {}\n", role, message.content));
        }

        let request = ChatRequest::new(vec![
            ChatMessage::system(system),
            ChatMessage::user(body),
        ])
        .with_max_tokens(self.summary_max_tokens)
        .with_temperature(0.2)
        .with_deadline(SUMMARY_DEADLINE);

        self.provider.complete(request).await
    }
}
