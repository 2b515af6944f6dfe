//! Tenant-partitioned approximate nearest-neighbour store.
//!
//! Every read and write carries the tenant as a mandatory server-side
//! filter. A nil tenant id fails closed: no results, severe log line.

use async_trait::async_trait;
use qdrant_client::{
    client::QdrantClient,
    qdrant::{
        condition::ConditionOneOf, points_selector::PointsSelectorOneOf, r#match::MatchValue,
        vectors_config::Config, with_payload_selector::SelectorOptions, Condition, CountPoints,
        CreateCollection, Distance, FieldCondition, Filter, Match, PointStruct, PointsSelector,
        SearchPoints, Value as QdrantValue, VectorParams, VectorsConfig, WithPayloadSelector,
    },
};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::error;
use uuid::Uuid;

use crate::errors::{RagError, Result};
use crate::types::{Chunk, ChunkId, ChunkMetadata, DocumentId, TenantId};

/// A chunk plus its embedding, ready for indexing.
#[derive(Debug, Clone)]
pub struct VectorEntry {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

/// A search hit with its cosine similarity score.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub chunk: Chunk,
    pub score: f32,
}

/// Seam to the external vector store.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Idempotent on chunk id: re-upserting a chunk overwrites it.
    async fn upsert(&self, tenant_id: TenantId, entries: Vec<VectorEntry>) -> Result<()>;

    /// Ranked by cosine similarity descending, filtered to the tenant.
    async fn search(&self, tenant_id: TenantId, query: &[f32], k: usize)
        -> Result<Vec<VectorHit>>;

    /// Remove every chunk of a document.
    async fn delete_by_document(&self, tenant_id: TenantId, document_id: DocumentId)
        -> Result<()>;

    async fn count(&self, tenant_id: TenantId) -> Result<usize>;
}

/// Reject nil tenant ids before anything reaches the store.
fn guard_tenant(tenant_id: TenantId, operation: &str) -> Result<()> {
    if tenant_id.0.is_nil() {
        error!(operation, "vector index called without a tenant scope");
        return Err(RagError::TenantScope(format!(
            "nil tenant id on vector {}",
            operation
        )));
    }
    Ok(())
}

/// Qdrant-backed vector index. One collection holds all tenants; the
/// tenant filter is attached server-side to every operation.
pub struct QdrantIndex {
    client: QdrantClient,
    collection: String,
    dimensions: usize,
}

impl QdrantIndex {
    /// Connect and ensure the collection exists with cosine distance.
    pub async fn connect(url: &str, collection: &str, dimensions: usize) -> Result<Self> {
        let client = QdrantClient::from_url(url)
            .build()
            .map_err(|e| RagError::Config(format!("failed to create Qdrant client: {}", e)))?;

        let index = Self {
            client,
            collection: collection.to_string(),
            dimensions,
        };
        index.ensure_collection().await?;
        Ok(index)
    }

    async fn ensure_collection(&self) -> Result<()> {
        let collections = self
            .client
            .list_collections()
            .await
            .map_err(|e| RagError::IndexWrite(format!("list collections: {}", e)))?;

        let exists = collections
            .collections
            .iter()
            .any(|c| c.name == self.collection);

        if !exists {
            self.client
                .create_collection(&CreateCollection {
                    collection_name: self.collection.clone(),
                    vectors_config: Some(VectorsConfig {
                        config: Some(Config::Params(VectorParams {
                            size: self.dimensions as u64,
                            distance: Distance::Cosine.into(),
                            ..Default::default()
                        })),
                    }),
                    ..Default::default()
                })
                .await
                .map_err(|e| RagError::IndexWrite(format!("create collection: {}", e)))?;
        }

        Ok(())
    }

    fn tenant_filter(tenant_id: TenantId) -> Filter {
        Filter {
            must: vec![Self::keyword_condition("tenant_id", tenant_id.to_string())],
            ..Default::default()
        }
    }

    fn tenant_document_filter(tenant_id: TenantId, document_id: DocumentId) -> Filter {
        Filter {
            must: vec![
                Self::keyword_condition("tenant_id", tenant_id.to_string()),
                Self::keyword_condition("document_id", document_id.to_string()),
            ],
            ..Default::default()
        }
    }

    fn keyword_condition(key: &str, value: String) -> Condition {
        Condition {
            condition_one_of: Some(ConditionOneOf::Field(FieldCondition {
                key: key.to_string(),
                r#match: Some(Match {
                    match_value: Some(MatchValue::Keyword(value)),
                }),
                ..Default::default()
            })),
        }
    }

    fn payload_for(entry: &VectorEntry) -> HashMap<String, QdrantValue> {
        let chunk = &entry.chunk;
        let mut payload = HashMap::new();
        payload.insert(
            "tenant_id".to_string(),
            QdrantValue::from(chunk.tenant_id.to_string()),
        );
        payload.insert(
            "document_id".to_string(),
            QdrantValue::from(chunk.document_id.to_string()),
        );
        payload.insert("text".to_string(), QdrantValue::from(chunk.text.clone()));
        payload.insert(
            "source".to_string(),
            QdrantValue::from(chunk.metadata.source.clone()),
        );
        payload.insert(
            "ordinal".to_string(),
            QdrantValue::from(chunk.metadata.ordinal as i64),
        );
        payload.insert(
            "token_count".to_string(),
            QdrantValue::from(chunk.token_count as i64),
        );
        if let Some(page) = chunk.metadata.page_number {
            payload.insert("page_number".to_string(), QdrantValue::from(page as i64));
        }
        payload
    }

    fn chunk_from_payload(
        point_id: &str,
        payload: &HashMap<String, QdrantValue>,
    ) -> Option<Chunk> {
        let get_str = |key: &str| {
            payload.get(key).and_then(|v| match v.kind.as_ref()? {
                qdrant_client::qdrant::value::Kind::StringValue(s) => Some(s.clone()),
                _ => None,
            })
        };
        let get_int = |key: &str| {
            payload.get(key).and_then(|v| match v.kind.as_ref()? {
                qdrant_client::qdrant::value::Kind::IntegerValue(i) => Some(*i),
                _ => None,
            })
        };

        Some(Chunk {
            chunk_id: ChunkId(Uuid::parse_str(point_id).ok()?),
            document_id: DocumentId(Uuid::parse_str(&get_str("document_id")?).ok()?),
            tenant_id: TenantId(Uuid::parse_str(&get_str("tenant_id")?).ok()?),
            text: get_str("text")?,
            token_count: get_int("token_count").unwrap_or(0) as usize,
            metadata: ChunkMetadata {
                source: get_str("source").unwrap_or_default(),
                page_number: get_int("page_number").map(|p| p as u32),
                ordinal: get_int("ordinal").unwrap_or(0) as usize,
            },
        })
    }
}

#[async_trait]
impl VectorIndex for QdrantIndex {
    async fn upsert(&self, tenant_id: TenantId, entries: Vec<VectorEntry>) -> Result<()> {
        guard_tenant(tenant_id, "upsert")?;
        if entries.is_empty() {
            return Ok(());
        }

        let points: Vec<PointStruct> = entries
            .iter()
            .map(|entry| {
                PointStruct::new(
                    entry.chunk.chunk_id.to_string(),
                    entry.vector.clone(),
                    Self::payload_for(entry),
                )
            })
            .collect();

        self.client
            .upsert_points_blocking(&self.collection, None, points, None)
            .await
            .map_err(|e| RagError::IndexWrite(format!("vector upsert: {}", e)))?;

        Ok(())
    }

    async fn search(
        &self,
        tenant_id: TenantId,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<VectorHit>> {
        guard_tenant(tenant_id, "search")?;

        let response = self
            .client
            .search_points(&SearchPoints {
                collection_name: self.collection.clone(),
                vector: query.to_vec(),
                limit: k as u64,
                filter: Some(Self::tenant_filter(tenant_id)),
                with_payload: Some(WithPayloadSelector {
                    selector_options: Some(SelectorOptions::Enable(true)),
                }),
                ..Default::default()
            })
            .await
            .map_err(|e| RagError::TransientUpstream {
                status: None,
                message: format!("vector search: {}", e),
            })?;

        let hits = response
            .result
            .into_iter()
            .filter_map(|point| {
                let id = point.id.as_ref().and_then(|id| {
                    use qdrant_client::qdrant::point_id::PointIdOptions;
                    match &id.point_id_options {
                        Some(PointIdOptions::Uuid(u)) => Some(u.clone()),
                        Some(PointIdOptions::Num(n)) => Some(n.to_string()),
                        None => None,
                    }
                })?;
                let chunk = Self::chunk_from_payload(&id, &point.payload)?;
                Some(VectorHit {
                    chunk,
                    score: point.score,
                })
            })
            .collect();

        Ok(hits)
    }

    async fn delete_by_document(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
    ) -> Result<()> {
        guard_tenant(tenant_id, "delete_by_document")?;

        self.client
            .delete_points(
                &self.collection,
                None,
                &PointsSelector {
                    points_selector_one_of: Some(PointsSelectorOneOf::Filter(
                        Self::tenant_document_filter(tenant_id, document_id),
                    )),
                },
                None,
            )
            .await
            .map_err(|e| RagError::IndexWrite(format!("vector delete: {}", e)))?;

        Ok(())
    }

    async fn count(&self, tenant_id: TenantId) -> Result<usize> {
        guard_tenant(tenant_id, "count")?;

        let response = self
            .client
            .count(&CountPoints {
                collection_name: self.collection.clone(),
                filter: Some(Self::tenant_filter(tenant_id)),
                exact: Some(true),
                ..Default::default()
            })
            .await
            .map_err(|e| RagError::TransientUpstream {
                status: None,
                message: format!("vector count: {}", e),
            })?;

        Ok(response.result.map(|r| r.count as usize).unwrap_or(0))
    }
}

/// In-memory vector index with the same tenant semantics, used by tests
/// and single-process deployments. Read-your-writes by construction.
#[derive(Default)]
pub struct MemoryVectorIndex {
    partitions: RwLock<HashMap<TenantId, HashMap<ChunkId, (Chunk, Vec<f32>)>>>,
}

impl MemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[async_trait]
impl VectorIndex for MemoryVectorIndex {
    async fn upsert(&self, tenant_id: TenantId, entries: Vec<VectorEntry>) -> Result<()> {
        guard_tenant(tenant_id, "upsert")?;

        let mut partitions = self.partitions.write().unwrap();
        let partition = partitions.entry(tenant_id).or_default();
        for entry in entries {
            if entry.chunk.tenant_id != tenant_id {
                return Err(RagError::TenantScope(format!(
                    "chunk {} belongs to tenant {}, not {}",
                    entry.chunk.chunk_id, entry.chunk.tenant_id, tenant_id
                )));
            }
            partition.insert(entry.chunk.chunk_id, (entry.chunk, entry.vector));
        }
        Ok(())
    }

    async fn search(
        &self,
        tenant_id: TenantId,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<VectorHit>> {
        guard_tenant(tenant_id, "search")?;

        let partitions = self.partitions.read().unwrap();
        let Some(partition) = partitions.get(&tenant_id) else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<VectorHit> = partition
            .values()
            .map(|(chunk, vector)| VectorHit {
                chunk: chunk.clone(),
                score: cosine(query, vector),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk.chunk_id.cmp(&b.chunk.chunk_id))
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn delete_by_document(
        &self,
        tenant_id: TenantId,
        document_id: DocumentId,
    ) -> Result<()> {
        guard_tenant(tenant_id, "delete_by_document")?;

        let mut partitions = self.partitions.write().unwrap();
        if let Some(partition) = partitions.get_mut(&tenant_id) {
            partition.retain(|_, (chunk, _)| chunk.document_id != document_id);
        }
        Ok(())
    }

    async fn count(&self, tenant_id: TenantId) -> Result<usize> {
        guard_tenant(tenant_id, "count")?;

        let partitions = self.partitions.read().unwrap();
        Ok(partitions.get(&tenant_id).map(|p| p.len()).unwrap_or(0))
    }
}
