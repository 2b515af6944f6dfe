//! ragmill - multi-tenant retrieval-augmented generation core
//!
//! The retrieval and answer-generation engine behind a multi-tenant RAG
//! service:
//!
//! - **Ingestion**: token-aware chunking, batched embeddings, and
//!   dual-indexing (dense + BM25) with at-least-once job semantics.
//! - **Hybrid retrieval**: parallel dense and sparse search fused with
//!   reciprocal rank fusion, then re-ranked by a batched LLM call.
//! - **Chat pipeline**: conversation memory with rolling summaries,
//!   intent planning, retrieval with a single expansion retry, and
//!   streaming grounded generation with citations.
//!
//! Every data-plane operation is parameterised by a tenant id; every
//! storage partition is keyed by it. The HTTP surface, relational
//! persistence, text extraction, and the models themselves are external
//! collaborators reached through the trait seams in each module.

pub mod chat;
pub mod config;
pub mod documents;
pub mod embed;
pub mod errors;
pub mod index;
pub mod ingest;
pub mod jobs;
pub mod llm;
pub mod retrieve;
pub mod service;
pub mod session;
pub mod telemetry;
pub mod types;

// Re-export the types most callers need.
pub use config::{Settings, TenantPersona};
pub use documents::DocumentService;
pub use errors::{RagError, Result};
pub use service::{RagService, ServiceStores};
