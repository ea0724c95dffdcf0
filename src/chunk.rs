//! Token-window text chunker.
//!
//! Splits extracted document text into chunks sized by the embedding
//! model's `chunk_size`, with `chunk_overlap` tokens carried over between
//! consecutive windows so passage boundaries do not cut answers in half.
//! Token counts are approximated at four characters per token.
//!
//! Each chunk gets a fresh UUID plus a SHA-256 hash of its text; the hash
//! travels into the vector store payload for staleness detection.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// A chunk of a document's extracted text.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub hash: String,
}

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Split text into overlapping windows of roughly `chunk_size` tokens.
/// Returns chunks with contiguous indices starting at 0; always at least one.
pub fn chunk_text(
    document_id: &str,
    text: &str,
    chunk_size: usize,
    chunk_overlap: usize,
) -> Vec<Chunk> {
    let max_chars = chunk_size.max(1) * CHARS_PER_TOKEN;
    // Overlap must leave room for forward progress
    let overlap_chars = (chunk_overlap * CHARS_PER_TOKEN).min(max_chars / 2);

    let words: Vec<&str> = text.split_whitespace().collect();
    if words.is_empty() {
        return vec![make_chunk(document_id, 0, text.trim())];
    }

    let mut chunks = Vec::new();
    let mut chunk_index: i64 = 0;
    let mut start = 0usize;

    while start < words.len() {
        let mut end = start;
        let mut chars = 0usize;

        while end < words.len() {
            let add = if chars == 0 {
                words[end].len()
            } else {
                chars + 1 + words[end].len()
            };
            if add > max_chars && end > start {
                break;
            }
            chars = add;
            end += 1;
        }

        chunks.push(make_chunk(
            document_id,
            chunk_index,
            &words[start..end].join(" "),
        ));
        chunk_index += 1;

        if end >= words.len() {
            break;
        }

        // Walk back from the window end until the overlap allowance is spent
        let mut next_start = end;
        let mut back_chars = 0usize;
        while next_start > start + 1 && back_chars < overlap_chars {
            next_start -= 1;
            back_chars += words[next_start].len() + 1;
        }
        start = next_start;
    }

    chunks
}

fn make_chunk(document_id: &str, index: i64, text: &str) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        id: Uuid::new_v4().to_string(),
        document_id: document_id.to_string(),
        chunk_index: index,
        text: text.to_string(),
        hash,
    }
}
