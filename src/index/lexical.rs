//! Tenant-partitioned BM25 index with file persistence.
//!
//! Each tenant owns one partition, serialised to
//! `<chunks_dir>/<tenant_id>.bm25` on every modification (write to a
//! `.tmp` sibling, then rename). Writers hold a per-tenant lock and swap
//! the in-memory snapshot atomically after persisting; readers score
//! against the last-committed snapshot without blocking.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use tokio::fs;
use tracing::{debug, error, warn};

use crate::errors::{RagError, Result};
use crate::types::{Chunk, ChunkId, DocumentId, TenantId};

/// BM25 parameters.
pub const K1: f64 = 1.5;
pub const B: f64 = 0.75;

/// On-disk format version.
const FORMAT_VERSION: u8 = 1;

/// Fixed English stopword list. No stemming.
const STOPWORDS: [&str; 50] = [
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "had", "has", "have",
    "he", "her", "his", "i", "if", "in", "into", "is", "it", "its", "me", "my", "no", "not", "of",
    "on", "or", "our", "she", "so", "that", "the", "their", "them", "then", "there", "they",
    "this", "to", "was", "we", "were", "will", "with", "you", "your",
];

/// A search hit with its BM25 score.
#[derive(Debug, Clone)]
pub struct LexicalHit {
    pub chunk: Chunk,
    pub score: f64,
}

/// Posting for one indexed chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Posting {
    document_id: DocumentId,
    term_freqs: HashMap<String, u32>,
    length: usize,
}

/// One tenant's complete index state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Partition {
    doc_freq: HashMap<String, u32>,
    postings: HashMap<ChunkId, Posting>,
    chunks: HashMap<ChunkId, Chunk>,
    total_length: usize,
}

/// Serialised envelope for a tenant's partition file.
#[derive(Serialize, Deserialize)]
struct PartitionFile {
    version: u8,
    tokenizer_hash: u64,
    partition: Partition,
}

impl Partition {
    fn insert(&mut self, chunk: Chunk) {
        // Replay-safe: drop any previous posting for this chunk first.
        self.remove(&chunk.chunk_id);

        let terms = tokenize(&chunk.text);
        let length = terms.len();
        let mut term_freqs: HashMap<String, u32> = HashMap::new();
        for term in terms {
            *term_freqs.entry(term).or_insert(0) += 1;
        }
        for term in term_freqs.keys() {
            *self.doc_freq.entry(term.clone()).or_insert(0) += 1;
        }

        self.total_length += length;
        self.postings.insert(
            chunk.chunk_id,
            Posting {
                document_id: chunk.document_id,
                term_freqs,
                length,
            },
        );
        self.chunks.insert(chunk.chunk_id, chunk);
    }

    fn remove(&mut self, chunk_id: &ChunkId) {
        if let Some(posting) = self.postings.remove(chunk_id) {
            for term in posting.term_freqs.keys() {
                if let Some(df) = self.doc_freq.get_mut(term) {
                    *df = df.saturating_sub(1);
                    if *df == 0 {
                        self.doc_freq.remove(term);
                    }
                }
            }
            self.total_length = self.total_length.saturating_sub(posting.length);
        }
        self.chunks.remove(chunk_id);
    }

    fn remove_document(&mut self, document_id: DocumentId) -> usize {
        let doomed: Vec<ChunkId> = self
            .postings
            .iter()
            .filter(|(_, p)| p.document_id == document_id)
            .map(|(id, _)| *id)
            .collect();
        for chunk_id in &doomed {
            self.remove(chunk_id);
        }
        doomed.len()
    }

    fn score(&self, query_terms: &[String], k: usize) -> Vec<(ChunkId, f64)> {
        if self.postings.is_empty() || query_terms.is_empty() {
            return Vec::new();
        }

        let n = self.postings.len() as f64;
        let avgdl = self.total_length as f64 / n;
        let unique_terms: HashSet<&String> = query_terms.iter().collect();

        let mut scored: Vec<(ChunkId, f64)> = self
            .postings
            .iter()
            .filter_map(|(chunk_id, posting)| {
                let mut score = 0.0;
                for term in &unique_terms {
                    let Some(&tf) = posting.term_freqs.get(*term) else {
                        continue;
                    };
                    let df = *self.doc_freq.get(*term).unwrap_or(&0) as f64;
                    let idf = (1.0 + (n - df + 0.5) / (df + 0.5)).ln();
                    let tf = tf as f64;
                    let denom = tf + K1 * (1.0 - B + B * posting.length as f64 / avgdl);
                    score += idf * tf * (K1 + 1.0) / denom;
                }
                (score > 0.0).then_some((*chunk_id, score))
            })
            .collect();

        // Ties broken by chunk id ascending for determinism.
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);
        scored
    }
}

/// Unicode-aware tokenizer: lowercase, split on non-alphanumerics,
/// stopwords removed.
pub fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|term| !term.is_empty() && !STOPWORDS.contains(term))
        .map(|term| term.to_string())
        .collect()
}

/// Hash of the tokenizer configuration; stored in each partition file so
/// an index built with different rules is not silently reused.
fn tokenizer_hash() -> u64 {
    let mut hasher = DefaultHasher::new();
    FORMAT_VERSION.hash(&mut hasher);
    STOPWORDS.hash(&mut hasher);
    "lowercase-alnum-nostem".hash(&mut hasher);
    hasher.finish()
}

/// Tenant-partitioned BM25 index.
pub struct Bm25Index {
    chunks_dir: PathBuf,
    /// Last-committed snapshots, swapped atomically by writers.
    snapshots: RwLock<HashMap<TenantId, Arc<Partition>>>,
    /// One writer at a time per tenant.
    writer_locks: Mutex<HashMap<TenantId, Arc<tokio::sync::Mutex<()>>>>,
}

impl Bm25Index {
    pub fn new(chunks_dir: impl Into<PathBuf>) -> Self {
        Self {
            chunks_dir: chunks_dir.into(),
            snapshots: RwLock::new(HashMap::new()),
            writer_locks: Mutex::new(HashMap::new()),
        }
    }

    fn file_path(&self, tenant_id: TenantId) -> PathBuf {
        self.chunks_dir.join(format!("{}.bm25", tenant_id))
    }

    fn writer_lock(&self, tenant_id: TenantId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.writer_locks.lock().unwrap();
        locks.entry(tenant_id).or_default().clone()
    }

    fn guard_tenant(tenant_id: TenantId, operation: &str) -> Result<()> {
        if tenant_id.0.is_nil() {
            error!(operation, "lexical index called without a tenant scope");
            return Err(RagError::TenantScope(format!(
                "nil tenant id on lexical {}",
                operation
            )));
        }
        Ok(())
    }

    /// Current snapshot for a tenant, loading from disk on first touch.
    async fn snapshot(&self, tenant_id: TenantId) -> Result<Arc<Partition>> {
        if let Some(partition) = self.snapshots.read().unwrap().get(&tenant_id) {
            return Ok(partition.clone());
        }

        let loaded = Arc::new(self.load_from_disk(tenant_id).await?);
        let mut snapshots = self.snapshots.write().unwrap();
        // A concurrent loader may have beaten us; keep whichever is there.
        Ok(snapshots.entry(tenant_id).or_insert(loaded).clone())
    }

    async fn load_from_disk(&self, tenant_id: TenantId) -> Result<Partition> {
        let path = self.file_path(tenant_id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Partition::default())
            }
            Err(e) => return Err(e.into()),
        };

        let file: PartitionFile = serde_json::from_slice(&bytes)?;
        if file.version != FORMAT_VERSION || file.tokenizer_hash != tokenizer_hash() {
            warn!(
                %tenant_id,
                version = file.version,
                "incompatible BM25 file, starting from an empty partition"
            );
            return Ok(Partition::default());
        }

        debug!(%tenant_id, chunks = file.partition.postings.len(), "loaded BM25 partition");
        Ok(file.partition)
    }

    /// Atomic persist: write the full partition to `.tmp`, then rename.
    async fn persist(&self, tenant_id: TenantId, partition: &Partition) -> Result<()> {
        fs::create_dir_all(&self.chunks_dir).await?;

        let file = PartitionFile {
            version: FORMAT_VERSION,
            tokenizer_hash: tokenizer_hash(),
            partition: partition.clone(),
        };
        let bytes = serde_json::to_vec(&file)?;

        let path = self.file_path(tenant_id);
        let tmp = path.with_extension("bm25.tmp");
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| RagError::IndexWrite(format!("rename BM25 file: {}", e)))?;

        Ok(())
    }

    /// Run a mutation under the tenant's writer lock: clone the snapshot,
    /// mutate, persist, then swap.
    async fn mutate<F, T>(&self, tenant_id: TenantId, mutation: F) -> Result<T>
    where
        F: FnOnce(&mut Partition) -> T,
    {
        let lock = self.writer_lock(tenant_id);
        let _guard = lock.lock().await;

        let mut partition = (*self.snapshot(tenant_id).await?).clone();
        let output = mutation(&mut partition);

        self.persist(tenant_id, &partition).await?;
        self.snapshots
            .write()
            .unwrap()
            .insert(tenant_id, Arc::new(partition));

        Ok(output)
    }

    /// Idempotent on chunk id: re-upserting a chunk replaces its posting.
    pub async fn upsert(&self, tenant_id: TenantId, chunks: Vec<Chunk>) -> Result<()> {
        Self::guard_tenant(tenant_id, "upsert")?;
        if chunks.is_empty() {
            return Ok(());
        }

        for chunk in &chunks {
            if chunk.tenant_id != tenant_id {
                return Err(RagError::TenantScope(format!(
                    "chunk {} belongs to tenant {}, not {}",
                    chunk.chunk_id, chunk.tenant_id, tenant_id
                )));
            }
        }

        self.mutate(tenant_id, move |partition| {
            for chunk in chunks {
                partition.insert(chunk);
            }
        })
        .await
    }

    /// BM25 search over the tenant's last-committed snapshot.
    pub async fn search(
        &self,
        tenant_id: TenantId,
        query: &str,
        k: usize,
    ) -> Result<Vec<LexicalHit>> {
        Self::guard_tenant(tenant_id, "search")?;

        let partition = self.snapshot(tenant_id).await?;
        let query_terms = tokenize(query);

        let hits = partition
            .score(&query_terms, k)
            .into_iter()
            .filter_map(|(chunk_id, score)| {
                partition.chunks.get(&chunk_id).map(|chunk| LexicalHit {
                    chunk: chunk.clone(),
                    score,
                })
            })
            .collect();

        Ok(hits)
    }

    /// Remove every chunk of a document. Returns the number removed.
    pub async fn delete_by_document(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
    ) -> Result<usize> {
        Self::guard_tenant(tenant_id, "delete_by_document")?;
        self.mutate(tenant_id, move |partition| {
            partition.remove_document(document_id)
        })
        .await
    }

    pub async fn count(&self, tenant_id: TenantId) -> Result<usize> {
        Self::guard_tenant(tenant_id, "count")?;
        Ok(self.snapshot(tenant_id).await?.postings.len())
    }

    /// Drop a tenant's partition entirely: snapshot and file.
    pub async fn purge_tenant(&self, tenant_id: TenantId) -> Result<()> {
        Self::guard_tenant(tenant_id, "purge_tenant")?;

        let lock = self.writer_lock(tenant_id);
        let _guard = lock.lock().await;

        self.snapshots.write().unwrap().remove(&tenant_id);
        match fs::remove_file(self.file_path(tenant_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
