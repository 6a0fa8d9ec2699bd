//! Paragraph-boundary text chunker.
//!
//! Splits document content into [`EmbeddingChunk`]s that respect a
//! configurable `max_tokens` limit. Splitting occurs on paragraph boundaries
//! (`\n\n`) to preserve semantic coherence within each chunk.
//!
//! Each chunk receives a deterministic, position-derived ID
//! (`{document_id}:{index}`) so the same document re-chunked later yields
//! the same IDs, enabling chunk-level diffing, plus a SHA-256 hash of its
//! text for change detection.

use crate::hash::chunk_content_hash;
use crate::models::EmbeddingChunk;

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Default chunk budget used by [`SourceDocument::embedding_chunks`]
/// implementations that do not override chunking.
///
/// [`SourceDocument::embedding_chunks`]: crate::sources::SourceDocument::embedding_chunks
pub const DEFAULT_MAX_TOKENS: usize = 512;

/// Split text into chunks on paragraph boundaries, respecting `max_tokens`.
/// Returns chunks with contiguous position-derived IDs starting at index 0.
/// Permission fields are left empty; batch preparation populates them from
/// the parent document.
pub fn split_into_chunks(document_id: &str, text: &str, max_tokens: usize) -> Vec<EmbeddingChunk> {
    let max_chars = max_tokens * CHARS_PER_TOKEN;

    if text.trim().is_empty() {
        return Vec::new();
    }

    let paragraphs: Vec<&str> = text.split("\n\n").collect();
    let mut pieces: Vec<String> = Vec::new();
    let mut current_buf = String::new();

    for para in paragraphs {
        let trimmed = para.trim();
        if trimmed.is_empty() {
            continue;
        }

        // If adding this paragraph would exceed max, flush current buffer
        let would_be = if current_buf.is_empty() {
            trimmed.len()
        } else {
            current_buf.len() + 2 + trimmed.len() // +2 for \n\n separator
        };

        if would_be > max_chars && !current_buf.is_empty() {
            pieces.push(std::mem::take(&mut current_buf));
        }

        // If a single paragraph exceeds max, hard-split it
        if trimmed.len() > max_chars {
            if !current_buf.is_empty() {
                pieces.push(std::mem::take(&mut current_buf));
            }
            let mut remaining = trimmed;
            while !remaining.is_empty() {
                let split_at = remaining.len().min(max_chars);
                // Prefer a newline or space boundary
                let actual_split = if split_at < remaining.len() {
                    remaining[..split_at]
                        .rfind('\n')
                        .or_else(|| remaining[..split_at].rfind(' '))
                        .map(|pos| pos + 1)
                        .unwrap_or(split_at)
                } else {
                    split_at
                };
                pieces.push(remaining[..actual_split].trim().to_string());
                remaining = &remaining[actual_split..];
            }
        } else {
            if !current_buf.is_empty() {
                current_buf.push_str("\n\n");
            }
            current_buf.push_str(trimmed);
        }
    }

    if !current_buf.is_empty() {
        pieces.push(current_buf);
    }

    pieces
        .into_iter()
        .enumerate()
        .map(|(index, piece)| make_chunk(document_id, index, piece))
        .collect()
}

fn make_chunk(document_id: &str, index: usize, text: String) -> EmbeddingChunk {
    EmbeddingChunk {
        deterministic_id: Some(format!("{}:{}", document_id, index)),
        content_hash: chunk_content_hash(&text),
        content: text,
        permission_policy: String::new(),
        permission_allowed_tokens: Vec::new(),
    }
}
