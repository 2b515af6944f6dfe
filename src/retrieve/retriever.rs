//! Hybrid retrieval: parallel dense + sparse search, RRF fusion, LLM
//! re-rank.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::embed::Embedder;
use crate::errors::Result;
use crate::index::{Bm25Index, VectorIndex};
use crate::retrieve::fusion::rrf_fuse;
use crate::retrieve::reranker::LlmReranker;
use crate::types::{Chunk, ChunkId, ScoredChunk, TenantId};

/// Candidate-list sizing for the retrieval pipeline.
#[derive(Debug, Clone)]
pub struct RetrieverConfig {
    /// Candidates fetched per branch before fusion.
    pub retrieval_top_k: usize,
    /// Fused candidates fed to the re-ranker.
    pub rerank_top_k: usize,
    /// Results returned to the generator.
    pub final_top_k: usize,
}

impl Default for RetrieverConfig {
    fn default() -> Self {
        Self {
            retrieval_top_k: 20,
            rerank_top_k: 10,
            final_top_k: 5,
        }
    }
}

/// Hybrid retriever over the tenant's dual indices.
pub struct HybridRetriever {
    embedder: Arc<dyn Embedder>,
    vector: Arc<dyn VectorIndex>,
    lexical: Arc<Bm25Index>,
    reranker: Option<LlmReranker>,
    config: RetrieverConfig,
}

impl HybridRetriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        vector: Arc<dyn VectorIndex>,
        lexical: Arc<Bm25Index>,
        reranker: Option<LlmReranker>,
        config: RetrieverConfig,
    ) -> Self {
        Self {
            embedder,
            vector,
            lexical,
            reranker,
            config,
        }
    }

    /// Retrieve the most relevant chunks for a query. An empty result is
    /// not an error; the orchestrator decides whether to retry.
    #[instrument(skip(self, query), fields(%tenant_id))]
    pub async fn retrieve(&self, tenant_id: TenantId, query: &str) -> Result<Vec<ScoredChunk>> {
        let fused = self.fused_candidates(tenant_id, query).await?;
        self.finish(query, fused).await
    }

    /// Union retrieval across query paraphrases for the expansion retry:
    /// candidates are deduplicated by chunk id keeping the maximum RRF
    /// score, then re-ranked against the original query.
    pub async fn retrieve_union(
        &self,
        tenant_id: TenantId,
        original_query: &str,
        queries: &[String],
    ) -> Result<Vec<ScoredChunk>> {
        let mut best: HashMap<ChunkId, ScoredChunk> = HashMap::new();

        for query in queries {
            for candidate in self.fused_candidates(tenant_id, query).await? {
                match best.get(&candidate.chunk.chunk_id) {
                    Some(existing) if existing.fused_score >= candidate.fused_score => {}
                    _ => {
                        best.insert(candidate.chunk.chunk_id, candidate);
                    }
                }
            }
        }

        let mut merged: Vec<ScoredChunk> = best.into_values().collect();
        merged.sort_by(|a, b| {
            b.fused_score
                .partial_cmp(&a.fused_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk.chunk_id.cmp(&b.chunk.chunk_id))
        });
        merged.truncate(self.config.rerank_top_k);

        self.finish(original_query, merged).await
    }

    /// Steps 1-3 of the pipeline: embed, search both branches in
    /// parallel, fuse, cut to the re-rank pool.
    async fn fused_candidates(
        &self,
        tenant_id: TenantId,
        query: &str,
    ) -> Result<Vec<ScoredChunk>> {
        let query_vector = self.embedder.embed_query(query).await?;

        let (dense, sparse) = tokio::join!(
            self.vector
                .search(tenant_id, &query_vector, self.config.retrieval_top_k),
            self.lexical
                .search(tenant_id, query, self.config.retrieval_top_k),
        );
        let dense = dense?;
        let sparse = sparse?;

        debug!(
            dense = dense.len(),
            sparse = sparse.len(),
            "retrieval branches complete"
        );

        let mut chunks: HashMap<ChunkId, Chunk> = HashMap::new();
        let dense_ids: Vec<ChunkId> = dense
            .iter()
            .map(|hit| {
                chunks.insert(hit.chunk.chunk_id, hit.chunk.clone());
                hit.chunk.chunk_id
            })
            .collect();
        let sparse_ids: Vec<ChunkId> = sparse
            .iter()
            .map(|hit| {
                chunks.insert(hit.chunk.chunk_id, hit.chunk.clone());
                hit.chunk.chunk_id
            })
            .collect();

        let mut fused: Vec<ScoredChunk> = rrf_fuse(&[&dense_ids, &sparse_ids])
            .into_iter()
            .filter_map(|(chunk_id, fused_score)| {
                chunks.remove(&chunk_id).map(|chunk| ScoredChunk {
                    chunk,
                    fused_score,
                    rerank_score: None,
                })
            })
            .collect();
        fused.truncate(self.config.rerank_top_k);

        Ok(fused)
    }

    /// Steps 4-5: optional LLM re-rank, then the final cut.
    async fn finish(&self, query: &str, fused: Vec<ScoredChunk>) -> Result<Vec<ScoredChunk>> {
        if fused.is_empty() {
            return Ok(Vec::new());
        }

        let mut ranked = match &self.reranker {
            Some(reranker) => reranker.rerank(query, fused).await,
            None => fused,
        };
        ranked.truncate(self.config.final_top_k);
        Ok(ranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embed::HashEmbedder;
    use crate::index::{MemoryVectorIndex, VectorEntry};
    use crate::types::{ChunkMetadata, DocumentId};
    use tempfile::TempDir;

    fn chunk(tenant: TenantId, doc: DocumentId, ordinal: usize, text: &str) -> Chunk {
        Chunk {
            chunk_id: ChunkId::derive(doc, ordinal),
            document_id: doc,
            tenant_id: tenant,
            text: text.to_string(),
            token_count: text.split_whitespace().count(),
            metadata: ChunkMetadata {
                source: "doc.txt".to_string(),
                page_number: None,
                ordinal,
            },
        }
    }

    async fn indexed_retriever(
        dir: &TempDir,
        tenant: TenantId,
        texts: &[&str],
    ) -> (HybridRetriever, DocumentId) {
        let embedder = Arc::new(HashEmbedder::new(32));
        let vector = Arc::new(MemoryVectorIndex::new());
        let lexical = Arc::new(Bm25Index::new(dir.path()));
        let doc = DocumentId::new();

        let chunks: Vec<Chunk> = texts
            .iter()
            .enumerate()
            .map(|(i, text)| chunk(tenant, doc, i, text))
            .collect();

        let batch = embedder
            .embed_batch(&chunks.iter().map(|c| c.text.clone()).collect::<Vec<_>>())
            .await
            .unwrap();
        let entries: Vec<VectorEntry> = chunks
            .iter()
            .cloned()
            .zip(batch.vectors)
            .map(|(chunk, vector)| VectorEntry { chunk, vector })
            .collect();

        vector.upsert(tenant, entries).await.unwrap();
        lexical.upsert(tenant, chunks).await.unwrap();

        let retriever = HybridRetriever::new(
            embedder,
            vector,
            lexical,
            None,
            RetrieverConfig::default(),
        );
        (retriever, doc)
    }

    #[tokio::test]
    async fn test_retrieve_finds_exact_text() {
        let dir = TempDir::new().unwrap();
        let tenant = TenantId::new();
        let (retriever, doc) = indexed_retriever(
            &dir,
            tenant,
            &[
                "refund policy lasts thirty days",
                "shipping takes two weeks worldwide",
            ],
        )
        .await;

        let results = retriever
            .retrieve(tenant, "refund policy lasts thirty days")
            .await
            .unwrap();

        assert!(!results.is_empty());
        assert_eq!(results[0].chunk.chunk_id, ChunkId::derive(doc, 0));
        // Exact text match: both branches rank it first.
        assert!((results[0].fused_score - 2.0 / 61.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_retrieve_empty_corpus() {
        let dir = TempDir::new().unwrap();
        let tenant = TenantId::new();
        let (retriever, _) = indexed_retriever(&dir, tenant, &[]).await;

        let results = retriever.retrieve(tenant, "anything").await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_retrieve_scoped_to_tenant() {
        let dir = TempDir::new().unwrap();
        let tenant = TenantId::new();
        let stranger = TenantId::new();
        let (retriever, _) =
            indexed_retriever(&dir, tenant, &["alpha secret material"]).await;

        let own = retriever.retrieve(tenant, "alpha secret").await.unwrap();
        assert!(!own.is_empty());
        assert!(own.iter().all(|c| c.chunk.tenant_id == tenant));

        let other = retriever.retrieve(stranger, "alpha secret").await.unwrap();
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn test_union_dedupes_keeping_max_score() {
        let dir = TempDir::new().unwrap();
        let tenant = TenantId::new();
        let (retriever, doc) = indexed_retriever(
            &dir,
            tenant,
            &["the guarantee covers manufacturing defects"],
        )
        .await;

        let queries = vec![
            "guarantee covers defects".to_string(),
            "the guarantee covers manufacturing defects".to_string(),
        ];
        let results = retriever
            .retrieve_union(tenant, "warranty", &queries)
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.chunk_id, ChunkId::derive(doc, 0));
        // The exact-match paraphrase scores 2/61; dedupe keeps the max.
        assert!((results[0].fused_score - 2.0 / 61.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_final_top_k_respected() {
        let dir = TempDir::new().unwrap();
        let tenant = TenantId::new();
        let texts: Vec<String> = (0..12)
            .map(|i| format!("shared topic words plus variant {}", i))
            .collect();
        let refs: Vec<&str> = texts.iter().map(|s| s.as_str()).collect();
        let (retriever, _) = indexed_retriever(&dir, tenant, &refs).await;

        let results = retriever
            .retrieve(tenant, "shared topic words")
            .await
            .unwrap();
        assert!(results.len() <= 5);
    }
}
