//! Service assembly: build the full ingestion and chat stack from
//! settings.
//!
//! The HTTP tier holds one [`RagService`] and calls into it per request.
//! Session and job rows live in the service's external store in
//! production; the bundled in-memory stores back single-process
//! deployments and tests, and both seams accept replacements.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::chat::{
    ChatOrchestrator, ConversationMemory, Generator, OrchestratorConfig, Planner, QueryExpander,
};
use crate::config::Settings;
use crate::documents::DocumentService;
use crate::embed::{Embedder, HttpEmbedder};
use crate::errors::Result;
use crate::index::{Bm25Index, QdrantIndex, VectorIndex};
use crate::ingest::{Chunker, DocumentStorage};
use crate::jobs::{
    job_queue, IngestWorker, JobStore, MemoryJobStore, PlainTextExtractor, TextExtractor,
};
use crate::llm::HttpChatClient;
use crate::retrieve::{HybridRetriever, LlmReranker, RetrieverConfig};
use crate::session::{MemorySessionStore, SessionStore};

impl RetrieverConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            retrieval_top_k: settings.retrieval_top_k,
            rerank_top_k: settings.rerank_top_k,
            final_top_k: settings.final_top_k,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_retries: settings.max_retries,
            enable_query_expansion: settings.enable_query_expansion,
            turn_deadline: Duration::from_secs(settings.turn_deadline_secs),
            persist_grace: Duration::from_secs(settings.persist_grace_secs),
        }
    }
}

/// Pluggable backing stores for [`RagService::build`].
pub struct ServiceStores {
    pub sessions: Arc<dyn SessionStore>,
    pub jobs: Arc<dyn JobStore>,
    pub extractor: Arc<dyn TextExtractor>,
}

impl Default for ServiceStores {
    fn default() -> Self {
        Self {
            sessions: Arc::new(MemorySessionStore::new()),
            jobs: Arc::new(MemoryJobStore::new()),
            extractor: Arc::new(PlainTextExtractor),
        }
    }
}

/// The assembled RAG core.
pub struct RagService {
    pub documents: Arc<DocumentService>,
    pub orchestrator: Arc<ChatOrchestrator>,
    pub jobs: Arc<dyn JobStore>,
    pub sessions: Arc<dyn SessionStore>,
    worker_handles: Vec<tokio::task::JoinHandle<()>>,
}

impl RagService {
    /// Build and start the stack against the configured providers:
    /// Qdrant for vectors, the OpenAI-compatible API for chat and
    /// embeddings, per-tenant BM25 files under `chunks_dir`.
    pub async fn from_settings(settings: Settings) -> Result<Self> {
        Self::build(settings, ServiceStores::default()).await
    }

    /// Build with caller-provided stores.
    pub async fn build(settings: Settings, stores: ServiceStores) -> Result<Self> {
        settings.validate()?;

        let chat_client = Arc::new(HttpChatClient::new(
            &settings.llm_base_url,
            &settings.llm_api_key,
            &settings.chat_model,
        )?);
        let embedder: Arc<dyn Embedder> = Arc::new(
            HttpEmbedder::new(
                &settings.llm_base_url,
                &settings.llm_api_key,
                &settings.embed_model,
                settings.embed_dim,
            )?
            .with_limits(settings.embed_max_batch, settings.embed_max_item_tokens),
        );

        let vector: Arc<dyn VectorIndex> = Arc::new(
            QdrantIndex::connect(
                &settings.qdrant_url,
                &settings.qdrant_collection,
                settings.embed_dim,
            )
            .await?,
        );
        let lexical = Arc::new(Bm25Index::new(settings.chunks_dir.clone()));

        let retriever = Arc::new(HybridRetriever::new(
            embedder.clone(),
            vector.clone(),
            lexical.clone(),
            Some(LlmReranker::new(chat_client.clone())),
            RetrieverConfig::from_settings(&settings),
        ));

        let memory = Arc::new(ConversationMemory::new(
            stores.sessions.clone(),
            chat_client.clone(),
            settings.memory_window,
            settings.summary_max_tokens,
        ));

        let orchestrator = Arc::new(ChatOrchestrator::new(
            Planner::new(chat_client.clone()),
            QueryExpander::new(chat_client.clone()),
            memory,
            retriever,
            Arc::new(Generator::new(chat_client)),
            stores.sessions.clone(),
            OrchestratorConfig::from_settings(&settings),
        ));

        let (queue, receiver) = job_queue(settings.queue_capacity);
        let worker = Arc::new(IngestWorker::new(
            stores.jobs.clone(),
            receiver,
            stores.extractor,
            Arc::new(Chunker::new(settings.chunk_size, settings.chunk_overlap)?),
            embedder,
            vector.clone(),
            lexical.clone(),
        ));
        let worker_handles = worker.start(settings.worker_count);

        let documents = Arc::new(DocumentService::new(
            DocumentStorage::new(settings.upload_dir.clone()),
            stores.jobs.clone(),
            queue,
            vector,
            lexical,
            stores.sessions.clone(),
        ));

        info!(
            workers = settings.worker_count,
            queue = settings.queue_capacity,
            "RAG core assembled"
        );

        Ok(Self {
            documents,
            orchestrator,
            jobs: stores.jobs,
            sessions: stores.sessions,
            worker_handles,
        })
    }

    /// Stop the ingestion workers. Queued jobs stay pending in the job
    /// store and are re-enqueued on the next start.
    pub fn shutdown(&mut self) {
        for handle in self.worker_handles.drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriever_config_from_settings() {
        let settings = Settings::default();
        let config = RetrieverConfig::from_settings(&settings);
        assert_eq!(config.retrieval_top_k, 20);
        assert_eq!(config.rerank_top_k, 10);
        assert_eq!(config.final_top_k, 5);
    }

    #[test]
    fn test_orchestrator_config_from_settings() {
        let settings = Settings::default();
        let config = OrchestratorConfig::from_settings(&settings);
        assert_eq!(config.max_retries, 1);
        assert!(config.enable_query_expansion);
        assert_eq!(config.turn_deadline, Duration::from_secs(60));
        assert_eq!(config.persist_grace, Duration::from_secs(5));
    }
}
