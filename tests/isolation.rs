//! Tenant isolation: one tenant's corpus is invisible to every other
//! tenant, and unscoped access fails closed.

use std::sync::Arc;
use tempfile::TempDir;

use ragmill::embed::{Embedder, HashEmbedder};
use ragmill::errors::RagError;
use ragmill::index::{Bm25Index, MemoryVectorIndex, VectorIndex};
use ragmill::ingest::Chunker;
use ragmill::jobs::{job_queue, IngestWorker, JobStore, MemoryJobStore, PlainTextExtractor};
use ragmill::retrieve::{HybridRetriever, RetrieverConfig};
use ragmill::types::{DocumentId, Job, JobKind, JobStatus, TenantId};

struct World {
    worker: IngestWorker,
    jobs: Arc<MemoryJobStore>,
    retriever: HybridRetriever,
    vector: Arc<MemoryVectorIndex>,
    dir: TempDir,
}

fn world() -> World {
    let dir = TempDir::new().unwrap();
    let jobs = Arc::new(MemoryJobStore::new());
    let embedder: Arc<dyn Embedder> = Arc::new(HashEmbedder::new(32));
    let vector = Arc::new(MemoryVectorIndex::new());
    let lexical = Arc::new(Bm25Index::new(dir.path().join("chunks")));
    let (_queue, receiver) = job_queue(8);

    let worker = IngestWorker::new(
        jobs.clone(),
        receiver,
        Arc::new(PlainTextExtractor),
        Arc::new(Chunker::new(64, 16).unwrap()),
        embedder.clone(),
        vector.clone(),
        lexical.clone(),
    );
    let retriever = HybridRetriever::new(
        embedder,
        vector.clone(),
        lexical,
        None,
        RetrieverConfig::default(),
    );

    World {
        worker,
        jobs,
        retriever,
        vector,
        dir,
    }
}

async fn ingest(world: &World, tenant: TenantId, text: &str) -> DocumentId {
    let document_id = DocumentId::new();
    let path = world.dir.path().join(format!("{}.txt", document_id));
    tokio::fs::write(&path, text).await.unwrap();

    let job = Job::new(tenant, JobKind::DocumentUpload { document_id, path });
    world.jobs.create(job.clone()).await.unwrap();
    world.worker.process(job.job_id).await;

    let done = world.jobs.get(job.job_id).await.unwrap().unwrap();
    assert_eq!(done.status, JobStatus::Completed);
    document_id
}

#[tokio::test]
async fn retrieval_returns_only_own_tenant_chunks() {
    let world = world();
    let t1 = TenantId::new();
    let t2 = TenantId::new();
    let t3 = TenantId::new();

    ingest(&world, t1, "The alpha secret is stored in vault one.").await;
    ingest(&world, t2, "The alpha secret appears here for tenant two.").await;

    let from_t1 = world.retriever.retrieve(t1, "alpha secret").await.unwrap();
    assert!(!from_t1.is_empty());
    assert!(from_t1.iter().all(|c| c.chunk.tenant_id == t1));

    let from_t2 = world.retriever.retrieve(t2, "alpha secret").await.unwrap();
    assert!(!from_t2.is_empty());
    assert!(from_t2.iter().all(|c| c.chunk.tenant_id == t2));

    // A tenant with no documents sees nothing at all.
    let from_t3 = world.retriever.retrieve(t3, "alpha secret").await.unwrap();
    assert!(from_t3.is_empty());
}

#[tokio::test]
async fn deleting_one_tenants_document_leaves_others_intact() {
    let world = world();
    let t1 = TenantId::new();
    let t2 = TenantId::new();

    let doc1 = ingest(&world, t1, "Shared phrasing about warranty coverage.").await;
    ingest(&world, t2, "Shared phrasing about warranty coverage.").await;

    world.vector.delete_by_document(t1, doc1).await.unwrap();

    assert_eq!(world.vector.count(t1).await.unwrap(), 0);
    assert!(world.vector.count(t2).await.unwrap() > 0);
}

#[tokio::test]
async fn nil_tenant_scope_fails_closed() {
    let world = world();
    let nil = TenantId(uuid::Uuid::nil());

    let result = world.retriever.retrieve(nil, "anything").await;
    assert!(matches!(result, Err(RagError::TenantScope(_))));
}
