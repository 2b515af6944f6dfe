//! Core data model: ids, documents, chunks, messages, jobs.
//!
//! Every data-bearing type carries its `TenantId`; the tenant is the
//! partition key for all storage and the mandatory filter on all reads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Namespace for deriving deterministic chunk ids (UUID v5).
const CHUNK_ID_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6b, 0xa7, 0xb8, 0x14, 0x9d, 0xad, 0x11, 0xd1, 0x80, 0xb4, 0x00, 0xc0, 0x4f, 0xd4, 0x30,
    0xc8,
]);

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random id.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                self.0.fmt(f)
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

id_type!(
    /// The top-level isolation unit. Partition key for every other entity.
    TenantId
);
id_type!(
    /// An uploaded document owned by a tenant.
    DocumentId
);
id_type!(
    /// A conversation owned by a tenant.
    SessionId
);
id_type!(
    /// A single message within a session.
    MessageId
);
id_type!(
    /// A unit of background work with persistent status.
    JobId
);

/// Identity of an indexed chunk. Stable and deterministic given
/// `(document_id, ordinal)` so re-ingestion is idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(pub Uuid);

impl ChunkId {
    /// Derive the stable id for a chunk from its document and ordinal.
    pub fn derive(document_id: DocumentId, ordinal: usize) -> Self {
        let name = format!("{}:{}", document_id, ordinal);
        Self(Uuid::new_v5(&CHUNK_ID_NAMESPACE, name.as_bytes()))
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// An uploaded document. Immutable once accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub document_id: DocumentId,
    pub tenant_id: TenantId,
    pub filename: String,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
}

/// Citation-bearing metadata attached to each chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Source filename for citation display.
    pub source: String,
    /// Page number, when the extractor provided one.
    pub page_number: Option<u32>,
    /// Position of the chunk within its document.
    pub ordinal: usize,
}

/// A bounded fragment of a document's text, the unit of indexing and
/// citation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: ChunkId,
    pub document_id: DocumentId,
    pub tenant_id: TenantId,
    pub text: String,
    pub token_count: usize,
    pub metadata: ChunkMetadata,
}

/// A retrieved chunk together with its score breakdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    /// Reciprocal-rank-fusion score across the dense and sparse lists.
    pub fused_score: f64,
    /// LLM re-rank score in [0, 10], when the re-ranker ran.
    pub rerank_score: Option<f64>,
}

impl ScoredChunk {
    /// Final ordering key: re-rank score when present, RRF otherwise.
    pub fn effective_score(&self) -> f64 {
        self.rerank_score.unwrap_or(self.fused_score)
    }
}

/// Message author role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

/// Chunk ids an assistant answer was grounded on, recorded so citations
/// are re-auditable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalMetadata {
    pub chunk_ids: Vec<ChunkId>,
}

/// A message within a chat session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub session_id: SessionId,
    pub tenant_id: TenantId,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retrieval_metadata: Option<RetrievalMetadata>,
}

impl Message {
    /// Build a user message for a session.
    pub fn user(session_id: SessionId, tenant_id: TenantId, content: impl Into<String>) -> Self {
        Self {
            message_id: MessageId::new(),
            session_id,
            tenant_id,
            role: MessageRole::User,
            content: content.into(),
            created_at: Utc::now(),
            retrieval_metadata: None,
        }
    }

    /// Build an assistant message, optionally carrying retrieval metadata.
    pub fn assistant(
        session_id: SessionId,
        tenant_id: TenantId,
        content: impl Into<String>,
        retrieval_metadata: Option<RetrievalMetadata>,
    ) -> Self {
        Self {
            message_id: MessageId::new(),
            session_id,
            tenant_id,
            role: MessageRole::Assistant,
            content: content.into(),
            created_at: Utc::now(),
            retrieval_metadata,
        }
    }
}

/// Rolling summary of the conversation older than the verbatim window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySummary {
    pub session_id: SessionId,
    pub tenant_id: TenantId,
    pub summary_text: String,
    /// Newest message folded into the summary.
    pub up_to_message_id: MessageId,
}

/// Kind of background work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    DocumentUpload {
        document_id: DocumentId,
        path: std::path::PathBuf,
    },
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// A unit of background work with persistent status. At-least-once
/// delivery; the worker must be safe under replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    pub kind: JobKind,
    pub status: JobStatus,
    /// Coarse progress in [0, 1].
    pub progress: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<HashMap<String, serde_json::Value>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a pending job for a tenant.
    pub fn new(tenant_id: TenantId, kind: JobKind) -> Self {
        let now = Utc::now();
        Self {
            job_id: JobId::new(),
            tenant_id,
            kind,
            status: JobStatus::Pending,
            progress: 0.0,
            error: None,
            result: None,
            created_at: now,
            updated_at: now,
        }
    }
}
