//! Token-aware text chunking with overlap.
//!
//! Windows advance by `chunk_size` tokens and retreat by `chunk_overlap`,
//! preferring a sentence terminator in the last tenth of the window. A
//! short final remainder merges into the previous chunk instead of
//! producing a fragment. Output is byte-identical across runs for fixed
//! input and parameters.

use tiktoken_rs::CoreBPE;

use crate::errors::{RagError, Result};
use crate::types::{Chunk, ChunkId, ChunkMetadata, DocumentId, TenantId};

/// Sentence terminators honoured by the soft boundary.
const SENTENCE_TERMINATORS: [char; 3] = ['.', '!', '?'];

/// Floor for the short-tail merge threshold.
const MIN_TAIL_TOKENS: usize = 32;

/// Token-aware splitter producing stable chunk identities.
pub struct Chunker {
    chunk_size: usize,
    chunk_overlap: usize,
    bpe: CoreBPE,
}

impl Chunker {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        if chunk_overlap >= chunk_size {
            return Err(RagError::Config(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                chunk_overlap, chunk_size
            )));
        }
        let bpe = tiktoken_rs::cl100k_base()
            .map_err(|e| RagError::Config(format!("failed to load tokenizer: {}", e)))?;

        Ok(Self {
            chunk_size,
            chunk_overlap,
            bpe,
        })
    }

    /// Split `text` into overlapping chunks for a document. Empty or
    /// whitespace-only input yields an empty list.
    pub fn chunk(
        &self,
        text: &str,
        document_id: DocumentId,
        tenant_id: TenantId,
        source: &str,
        page_number: Option<u32>,
    ) -> Result<Vec<Chunk>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let tokens = self.bpe.encode_ordinary(text);
        let total = tokens.len();
        let min_tail = MIN_TAIL_TOKENS.min(self.chunk_overlap);

        let mut chunks: Vec<Chunk> = Vec::new();
        let mut start = 0usize;
        let mut ordinal = 0usize;

        while start < total {
            let remaining = total - start;

            // Final window: emit the remainder, or fold a short tail into
            // the previous chunk. The tail beyond the shared overlap is
            // what actually gets appended.
            if remaining <= self.chunk_size {
                if remaining <= min_tail && !chunks.is_empty() {
                    let prev = chunks.last_mut().unwrap();
                    let tail_start = start + self.chunk_overlap.min(remaining);
                    if tail_start < total {
                        let tail_text = self.decode(&tokens[tail_start..total])?;
                        prev.text.push_str(&tail_text);
                        prev.token_count += total - tail_start;
                    }
                } else {
                    let text = self.decode(&tokens[start..total])?;
                    chunks.push(self.build_chunk(
                        text,
                        remaining,
                        ordinal,
                        document_id,
                        tenant_id,
                        source,
                        page_number,
                    ));
                }
                break;
            }

            // The soft boundary may pull the cut back, but never far
            // enough to stop the window advancing past the overlap.
            let end = self
                .soft_boundary(&tokens, start, start + self.chunk_size)
                .max(start + self.chunk_overlap + 1);
            let text = self.decode(&tokens[start..end])?;
            chunks.push(self.build_chunk(
                text,
                end - start,
                ordinal,
                document_id,
                tenant_id,
                source,
                page_number,
            ));
            ordinal += 1;

            start = end - self.chunk_overlap;
        }

        Ok(chunks)
    }

    /// Prefer a sentence terminator within the last tenth of the window.
    /// The cut point never moves far enough back to stall advancement.
    fn soft_boundary(&self, tokens: &[usize], start: usize, end: usize) -> usize {
        let window = end - start;
        let floor = end - (window / 10).max(1);

        for i in (floor..end).rev() {
            if let Ok(piece) = self.bpe.decode(vec![tokens[i]]) {
                let trimmed =
                    piece.trim_end_matches(|c: char| matches!(c, '"' | '\'' | ')' | ']' | ' ' | '\n'));
                if trimmed
                    .chars()
                    .last()
                    .is_some_and(|c| SENTENCE_TERMINATORS.contains(&c))
                {
                    return i + 1;
                }
            }
        }

        end
    }

    fn decode(&self, tokens: &[usize]) -> Result<String> {
        self.bpe
            .decode(tokens.to_vec())
            .map_err(|e| RagError::Internal(format!("token decode failed: {}", e)))
    }

    #[allow(clippy::too_many_arguments)]
    fn build_chunk(
        &self,
        text: String,
        token_count: usize,
        ordinal: usize,
        document_id: DocumentId,
        tenant_id: TenantId,
        source: &str,
        page_number: Option<u32>,
    ) -> Chunk {
        Chunk {
            chunk_id: ChunkId::derive(document_id, ordinal),
            document_id,
            tenant_id,
            text,
            token_count,
            metadata: ChunkMetadata {
                source: source.to_string(),
                page_number,
                ordinal,
            },
        }
    }
}
