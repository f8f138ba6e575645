use crate::config::ChunkConfig;

/// A contiguous substring of a document, the unit of vector indexing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Emission index; contiguous from 0 for every document.
    pub ordinal: usize,
    pub text: String,
}

/// Split `text` into overlapping windows of `chunk_size` characters stepping
/// `chunk_size - chunk_overlap`. A window is emitted only when its trimmed
/// length is at least `min_chunk` characters; the last window is not padded.
///
/// Pure and deterministic; config validation guarantees `overlap < size`.
pub fn chunk_text(text: &str, cfg: &ChunkConfig) -> Vec<Chunk> {
    if text.trim().is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = text.chars().collect();
    let step = cfg.chunk_size - cfg.chunk_overlap;

    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < chars.len() {
        let end = (start + cfg.chunk_size).min(chars.len());
        let window: String = chars[start..end].iter().collect();
        let trimmed = window.trim();
        if trimmed.chars().count() >= cfg.min_chunk {
            chunks.push(Chunk {
                ordinal: chunks.len(),
                text: trimmed.to_string(),
            });
        }
        start += step;
    }
    chunks
}
