use std::path::PathBuf;
use std::time::SystemTime;

use serde::Serialize;

/// Characters kept when previewing document text in results.
const PREVIEW_CHARS: usize = 200;

/// Truncate to the preview length on a char boundary.
pub fn preview(text: &str) -> String {
    text.chars().take(PREVIEW_CHARS).collect()
}

/// A document that survived extraction. The doc-id is the canonicalized
/// absolute path and is the primary key across every component.
#[derive(Debug, Clone)]
pub struct Document {
    pub doc_id: String,
    pub path: PathBuf,
    pub text: String,
    /// On-disk size in bytes at extraction time.
    pub size: u64,
    /// xxh3 hex digest of the raw file bytes at extraction time.
    pub content_hash: String,
    pub extension: String,
    pub extracted_at: SystemTime,
}

impl Document {
    pub fn new(doc_id: String, path: PathBuf, text: String, size: u64, content_hash: String) -> Self {
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        Self {
            doc_id,
            path,
            text,
            size,
            content_hash,
            extension,
            extracted_at: SystemTime::now(),
        }
    }
}

/// Which retriever produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchOrigin {
    #[serde(rename = "lex")]
    Lexical,
    #[serde(rename = "vec")]
    Vector,
    Fused,
}

impl std::fmt::Display for SearchOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SearchOrigin::Lexical => f.write_str("lex"),
            SearchOrigin::Vector => f.write_str("vec"),
            SearchOrigin::Fused => f.write_str("fused"),
        }
    }
}

/// One ranked hit. `metadata` carries origin-specific extras; fused results
/// record the pre-fusion score and origin of their best source hit there.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub doc_id: String,
    pub path: PathBuf,
    pub snippet: String,
    pub score: f32,
    pub origin: SearchOrigin,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl SearchResult {
    pub fn new(doc_id: String, path: PathBuf, snippet: String, score: f32, origin: SearchOrigin) -> Self {
        Self {
            doc_id,
            path,
            snippet,
            score,
            origin,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.doc_id.clone())
    }
}

/// A per-retriever ranked list handed to the reranker. Position 0 is rank 1.
#[derive(Debug, Clone)]
pub struct RetrievalResult {
    pub retriever_name: &'static str,
    pub results: Vec<SearchResult>,
    pub weight: f32,
}
