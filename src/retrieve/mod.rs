//! Hybrid retrieval: fusion, re-ranking, and the retriever pipeline.

pub mod fusion;
pub mod reranker;
pub mod retriever;

pub use fusion::{rrf_fuse, RRF_K};
pub use reranker::LlmReranker;
pub use retriever::{HybridRetriever, RetrieverConfig};
