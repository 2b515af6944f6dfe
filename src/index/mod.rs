//! Dual chunk indices: dense vectors and sparse BM25, both partitioned
//! by tenant.

pub mod lexical;
pub mod vector;

pub use lexical::{Bm25Index, LexicalHit};
pub use vector::{MemoryVectorIndex, QdrantIndex, VectorEntry, VectorHit, VectorIndex};
