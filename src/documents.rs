//! Document lifecycle: accept uploads, cascade deletes, tenant purge.
//!
//! Accepting an upload persists the raw file, registers the document,
//! creates a pending job, and enqueues it. Deletion is first-class and
//! cascades to the stored file and both indices. Purging a tenant removes
//! everything the tenant transitively owns.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, warn};

use crate::errors::{RagError, Result};
use crate::index::{Bm25Index, VectorIndex};
use crate::ingest::DocumentStorage;
use crate::jobs::{JobQueue, JobStore};
use crate::session::SessionStore;
use crate::types::{Document, DocumentId, Job, JobKind, TenantId};

/// Enqueue retries when the ingestion queue is full.
const ENQUEUE_ATTEMPTS: u32 = 3;
const ENQUEUE_BACKOFF: Duration = Duration::from_millis(200);

/// Document lifecycle coordinator.
pub struct DocumentService {
    storage: DocumentStorage,
    registry: RwLock<HashMap<DocumentId, Document>>,
    jobs: Arc<dyn JobStore>,
    queue: JobQueue,
    vector: Arc<dyn VectorIndex>,
    lexical: Arc<Bm25Index>,
    sessions: Arc<dyn SessionStore>,
}

impl DocumentService {
    pub fn new(
        storage: DocumentStorage,
        jobs: Arc<dyn JobStore>,
        queue: JobQueue,
        vector: Arc<dyn VectorIndex>,
        lexical: Arc<Bm25Index>,
        sessions: Arc<dyn SessionStore>,
    ) -> Self {
        Self {
            storage,
            registry: RwLock::new(HashMap::new()),
            jobs,
            queue,
            vector,
            lexical,
            sessions,
        }
    }

    /// Accept an upload: store the file, register the document, create a
    /// pending job, and enqueue it. A full queue leaves the job pending;
    /// enqueueing is retried briefly with backoff, and the job can be
    /// re-enqueued later either way.
    pub async fn accept_upload(
        &self,
        tenant_id: TenantId,
        filename: &str,
        bytes: &[u8],
    ) -> Result<(Document, Job)> {
        if tenant_id.0.is_nil() {
            return Err(RagError::TenantScope(
                "nil tenant id on upload".to_string(),
            ));
        }

        let document_id = DocumentId::new();
        let ext = filename.rsplit('.').next().filter(|e| *e != filename).unwrap_or("txt");
        let path = self.storage.save(tenant_id, document_id, ext, bytes).await?;

        let document = Document {
            document_id,
            tenant_id,
            filename: filename.to_string(),
            size: bytes.len() as u64,
            uploaded_at: Utc::now(),
        };
        self.registry
            .write()
            .unwrap()
            .insert(document_id, document.clone());

        let job = Job::new(
            tenant_id,
            JobKind::DocumentUpload { document_id, path },
        );
        self.jobs.create(job.clone()).await?;

        let mut enqueued = false;
        for attempt in 0..ENQUEUE_ATTEMPTS {
            if self.queue.try_enqueue(job.job_id) {
                enqueued = true;
                break;
            }
            warn!(job_id = %job.job_id, attempt, "ingestion queue full, backing off");
            tokio::time::sleep(ENQUEUE_BACKOFF * (attempt + 1)).await;
        }
        if !enqueued {
            warn!(job_id = %job.job_id, "job left pending, queue saturated");
        }

        info!(%tenant_id, %document_id, filename, enqueued, "upload accepted");
        Ok((document, job))
    }

    /// Look up a document, scoped to the owning tenant.
    pub fn get_document(&self, tenant_id: TenantId, document_id: DocumentId) -> Option<Document> {
        self.registry
            .read()
            .unwrap()
            .get(&document_id)
            .filter(|d| d.tenant_id == tenant_id)
            .cloned()
    }

    /// Documents owned by a tenant, newest first.
    pub fn list_documents(&self, tenant_id: TenantId) -> Vec<Document> {
        let registry = self.registry.read().unwrap();
        let mut documents: Vec<Document> = registry
            .values()
            .filter(|d| d.tenant_id == tenant_id)
            .cloned()
            .collect();
        documents.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        documents
    }

    /// Delete a document and everything derived from it: the stored
    /// file and every chunk in both indices. Other documents are
    /// untouched.
    pub async fn delete_document(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
    ) -> Result<()> {
        let Some(document) = self.get_document(tenant_id, document_id) else {
            return Err(RagError::TenantScope(format!(
                "document {} not found for tenant",
                document_id
            )));
        };

        let ext = document
            .filename
            .rsplit('.')
            .next()
            .filter(|e| *e != document.filename)
            .unwrap_or("txt");
        let path = self.storage.path_for(tenant_id, document_id, ext);
        self.storage.delete(&path).await?;

        self.vector.delete_by_document(tenant_id, document_id).await?;
        self.lexical.delete_by_document(tenant_id, document_id).await?;

        self.registry.write().unwrap().remove(&document_id);
        info!(%tenant_id, %document_id, "document deleted");
        Ok(())
    }

    /// Delete everything a tenant transitively owns: documents, chunks in
    /// both indices, stored files, sessions, and jobs.
    pub async fn purge_tenant(&self, tenant_id: TenantId) -> Result<()> {
        let documents = self.list_documents(tenant_id);
        for document in &documents {
            self.vector
                .delete_by_document(tenant_id, document.document_id)
                .await?;
        }
        self.lexical.purge_tenant(tenant_id).await?;
        self.storage.purge_tenant(tenant_id).await?;
        self.sessions.purge_tenant(tenant_id).await?;
        self.jobs.purge_tenant(tenant_id).await?;

        self.registry
            .write()
            .unwrap()
            .retain(|_, d| d.tenant_id != tenant_id);

        info!(%tenant_id, documents = documents.len(), "tenant purged");
        Ok(())
    }
}
