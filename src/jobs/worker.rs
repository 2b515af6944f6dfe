//! Ingestion worker: chunk, embed, and dual-index uploaded documents.
//!
//! At-least-once semantics: a job may be delivered more than once. Chunk
//! ids are deterministic and upserts idempotent, and each run starts by
//! clearing the document from both indices, so replays overwrite instead
//! of duplicating. Both indices must be updated before a job completes;
//! a partial write is rolled back so they stay consistent.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::embed::Embedder;
use crate::errors::{RagError, Result};
use crate::index::{Bm25Index, VectorEntry, VectorIndex};
use crate::ingest::Chunker;
use crate::jobs::queue::JobReceiver;
use crate::jobs::store::{JobStore, JobUpdate};
use crate::types::{DocumentId, Job, JobId, JobKind, JobStatus, TenantId};

/// Seam to file-type-specific text extraction; the core consumes
/// already-extracted UTF-8 text.
#[async_trait]
pub trait TextExtractor: Send + Sync {
    async fn extract(&self, path: &Path) -> Result<String>;
}

/// Extractor for plain UTF-8 files.
pub struct PlainTextExtractor;

#[async_trait]
impl TextExtractor for PlainTextExtractor {
    async fn extract(&self, path: &Path) -> Result<String> {
        Ok(tokio::fs::read_to_string(path).await?)
    }
}

/// Worker over the ingestion queue.
pub struct IngestWorker {
    jobs: Arc<dyn JobStore>,
    receiver: JobReceiver,
    extractor: Arc<dyn TextExtractor>,
    chunker: Arc<Chunker>,
    embedder: Arc<dyn Embedder>,
    vector: Arc<dyn VectorIndex>,
    lexical: Arc<Bm25Index>,
}

impl IngestWorker {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        receiver: JobReceiver,
        extractor: Arc<dyn TextExtractor>,
        chunker: Arc<Chunker>,
        embedder: Arc<dyn Embedder>,
        vector: Arc<dyn VectorIndex>,
        lexical: Arc<Bm25Index>,
    ) -> Self {
        Self {
            jobs,
            receiver,
            extractor,
            chunker,
            embedder,
            vector,
            lexical,
        }
    }

    /// Spawn `count` worker tasks sharing the queue.
    pub fn start(self: Arc<Self>, count: usize) -> Vec<JoinHandle<()>> {
        (0..count.max(1))
            .map(|worker| {
                let this = self.clone();
                tokio::spawn(async move {
                    info!(worker, "ingestion worker started");
                    while let Some(job_id) = this.receiver.next().await {
                        this.process(job_id).await;
                    }
                    info!(worker, "ingestion worker stopped");
                })
            })
            .collect()
    }

    /// Process one delivered job id. Failures land on the job row, never
    /// on the worker loop.
    #[instrument(skip(self), fields(%job_id))]
    pub async fn process(&self, job_id: JobId) {
        let job = match self.jobs.get(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!("job vanished before processing");
                return;
            }
            Err(e) => {
                error!(error = %e, "could not load job");
                return;
            }
        };

        if let Err(e) = self.run_pipeline(&job).await {
            error!(error = %e, kind = e.kind(), "ingestion failed");
            let _ = self
                .jobs
                .update_status(
                    job_id,
                    JobUpdate::status(JobStatus::Failed).with_error(format!(
                        "{}: {}",
                        e.kind(),
                        e
                    )),
                )
                .await;
        }
    }

    async fn run_pipeline(&self, job: &Job) -> Result<()> {
        let JobKind::DocumentUpload { document_id, path } = &job.kind;
        let tenant_id = job.tenant_id;

        self.jobs
            .update_status(
                job.job_id,
                JobUpdate::status(JobStatus::Processing).with_progress(0.1),
            )
            .await?;

        let text = self.extractor.extract(path).await?;
        let filename = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| document_id.to_string());

        let chunks = self
            .chunker
            .chunk(&text, *document_id, tenant_id, &filename, None)?;

        if chunks.is_empty() {
            // Nothing to embed or index; the job still completes.
            self.jobs
                .update_status(
                    job.job_id,
                    JobUpdate::status(JobStatus::Completed)
                        .with_progress(1.0)
                        .with_result(HashMap::from([
                            ("chunks_created".to_string(), json!(0)),
                            ("embeddings_generated".to_string(), json!(0)),
                        ])),
                )
                .await?;
            return Ok(());
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let batch = self
            .embedder
            .embed_batch(&texts)
            .await
            .map_err(|e| RagError::EmbedFailure(e.to_string()))?;
        if batch.vectors.len() != chunks.len() {
            return Err(RagError::EmbedFailure(format!(
                "expected {} embeddings, got {}",
                chunks.len(),
                batch.vectors.len()
            )));
        }

        self.jobs
            .update_status(job.job_id, JobUpdate::default().with_progress(0.5))
            .await?;

        self.index_document(tenant_id, *document_id, &chunks, batch.vectors)
            .await?;

        self.jobs
            .update_status(job.job_id, JobUpdate::default().with_progress(0.9))
            .await?;

        let mut result = HashMap::from([
            ("chunks_created".to_string(), json!(chunks.len())),
            ("embeddings_generated".to_string(), json!(chunks.len())),
        ]);
        if !batch.warnings.is_empty() {
            result.insert("warnings".to_string(), json!(batch.warnings));
        }

        self.jobs
            .update_status(
                job.job_id,
                JobUpdate::status(JobStatus::Completed)
                    .with_progress(1.0)
                    .with_result(result),
            )
            .await?;

        info!(%tenant_id, %document_id, chunks = chunks.len(), "document ingested");
        Ok(())
    }

    /// Write the document into both indices. Any prior partial state for
    /// the document is cleared first (replay overwrites); if the second
    /// index fails, the first is rolled back so both hold the document or
    /// neither does.
    async fn index_document(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
        chunks: &[crate::types::Chunk],
        vectors: Vec<Vec<f32>>,
    ) -> Result<()> {
        self.vector.delete_by_document(tenant_id, document_id).await?;
        self.lexical.delete_by_document(tenant_id, document_id).await?;

        let entries: Vec<VectorEntry> = chunks
            .iter()
            .cloned()
            .zip(vectors)
            .map(|(chunk, vector)| VectorEntry { chunk, vector })
            .collect();
        self.vector.upsert(tenant_id, entries).await?;

        if let Err(e) = self.lexical.upsert(tenant_id, chunks.to_vec()).await {
            warn!(error = %e, "lexical upsert failed, rolling back vector writes");
            if let Err(rollback) = self.vector.delete_by_document(tenant_id, document_id).await
            {
                error!(error = %rollback, "vector rollback failed, indices inconsistent");
            }
            return Err(RagError::IndexWrite(format!("lexical upsert: {}", e)));
        }

        Ok(())
    }
}
