use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use bm25::{EmbedderBuilder, ScoredDocument, Scorer};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::LexicalConfig;
use crate::error::{Error, Result};
use crate::types::{preview, Document, SearchOrigin, SearchResult};

pub const RETRIEVER_NAME: &str = "lexical";

/// On-disk artifact format version; mismatches are rejected on load.
const ARTIFACT_VERSION: u32 = 1;

/// Surface-form tokenizer for the sparse index: lowercase, split on
/// whitespace, drop empties. Deterministic across calls; no stopword removal.
/// It doubles as the bm25 crate's tokenizer, so a stored token list joined
/// with single spaces re-tokenizes to itself.
#[derive(Debug, Default, Clone)]
pub struct WhitespaceTokenizer;

impl WhitespaceTokenizer {
    pub fn tokenize(text: &str) -> Vec<String> {
        text.split_whitespace()
            .map(|t| t.to_lowercase())
            .filter(|t| !t.is_empty())
            .collect()
    }
}

impl bm25::Tokenizer for WhitespaceTokenizer {
    fn tokenize(&self, input_text: &str) -> Vec<String> {
        Self::tokenize(input_text)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocEntry {
    path: PathBuf,
    tokens: Vec<String>,
}

/// Persisted payload: BM25 parameters, token lists, doc-id list in matching
/// order, and document count. The scorer itself is rebuilt from the token
/// lists on load — the rebuild-on-stale policy makes a serialized index
/// redundant.
#[derive(Debug, Serialize, Deserialize)]
struct LexicalArtifact {
    version: u32,
    k1: f32,
    b: f32,
    doc_ids: Vec<String>,
    docs: BTreeMap<String, DocEntry>,
    document_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenCacheEntry {
    size: u64,
    /// xxh3 hex digest of the raw file bytes the tokens were derived from.
    hash: String,
    tokens: Vec<String>,
}

/// Cold-start cache mapping doc-id → token list plus the content fingerprint
/// it was derived from. A latency optimization only, never a source of truth.
#[derive(Debug, Default, Serialize, Deserialize)]
struct TokenCache {
    entries: BTreeMap<String, TokenCacheEntry>,
}

struct Bm25Index {
    embedder: bm25::Embedder<u32, WhitespaceTokenizer>,
    scorer: Scorer<String, u32>,
}

/// BM25 retriever over whole documents. All mutating and querying operations
/// run under the caller's exclusive lock; `add`/`remove` only mark the index
/// stale, and the next `search` (or an explicit `rebuild`) reconstructs it
/// from the current token lists.
pub struct LexicalRetriever {
    cfg: LexicalConfig,
    index_path: PathBuf,
    cache_path: PathBuf,
    /// doc-id → entry. BTreeMap so iteration order is stable across a
    /// snapshot, which keeps rebuilds and search results deterministic.
    docs: BTreeMap<String, DocEntry>,
    cache: TokenCache,
    index: Option<Bm25Index>,
    stale: bool,
}

impl LexicalRetriever {
    pub fn new(cfg: LexicalConfig, index_path: PathBuf, cache_path: PathBuf) -> Self {
        Self {
            cfg,
            index_path,
            cache_path,
            docs: BTreeMap::new(),
            cache: TokenCache::default(),
            index: None,
            stale: false,
        }
    }

    pub fn document_count(&self) -> usize {
        self.docs.len()
    }

    pub fn contains(&self, doc_id: &str) -> bool {
        self.docs.contains_key(doc_id)
    }

    /// Fingerprint stored with the cached tokens for `doc_id`, if any.
    pub fn cached_fingerprint(&self, doc_id: &str) -> Option<(u64, String)> {
        self.cache
            .entries
            .get(doc_id)
            .map(|e| (e.size, e.hash.clone()))
    }

    /// Tokenize and insert (or replace) the entry for the document, marking
    /// the index stale.
    pub fn add(&mut self, doc: &Document) -> Result<()> {
        let tokens = WhitespaceTokenizer::tokenize(&doc.text);
        if tokens.is_empty() {
            return Err(Error::EmptyTokens(doc.doc_id.clone()));
        }

        self.cache.entries.insert(
            doc.doc_id.clone(),
            TokenCacheEntry {
                size: doc.size,
                hash: doc.content_hash.clone(),
                tokens: tokens.clone(),
            },
        );
        let replaced = self
            .docs
            .insert(
                doc.doc_id.clone(),
                DocEntry {
                    path: doc.path.clone(),
                    tokens,
                },
            )
            .is_some();
        self.stale = true;

        debug!(
            doc = %doc.doc_id,
            action = if replaced { "update" } else { "add" },
            "lexical document indexed"
        );
        Ok(())
    }

    /// Drop the entry if present; returns whether a removal occurred.
    pub fn remove(&mut self, doc_id: &str) -> bool {
        self.cache.entries.remove(doc_id);
        let removed = self.docs.remove(doc_id).is_some();
        if removed {
            self.stale = true;
            debug!(doc = doc_id, "lexical document removed");
        }
        removed
    }

    /// Reconstruct the BM25 index from the current token lists.
    pub fn rebuild(&mut self) {
        self.index = self.build_index();
        self.stale = false;
        debug!(docs = self.docs.len(), "lexical index rebuilt");
    }

    fn build_index(&self) -> Option<Bm25Index> {
        if self.docs.is_empty() {
            return None;
        }
        let total_tokens: usize = self.docs.values().map(|d| d.tokens.len()).sum();
        let avgdl = total_tokens as f32 / self.docs.len() as f32;

        let embedder = EmbedderBuilder::<u32, WhitespaceTokenizer>::with_avgdl(avgdl)
            .k1(self.cfg.k1)
            .b(self.cfg.b)
            .build();
        let mut scorer = Scorer::<String, u32>::new();
        for (doc_id, entry) in &self.docs {
            let embedding = embedder.embed(&entry.tokens.join(" "));
            scorer.upsert(doc_id, embedding);
        }
        Some(Bm25Index { embedder, scorer })
    }

    /// BM25 search over the current snapshot. Rebuilds first when stale, so
    /// rebuild and search are serialized under the retriever's lock.
    pub fn search(&mut self, query: &str, k: usize) -> Result<Vec<SearchResult>> {
        if self.stale || self.index.is_none() {
            self.rebuild();
        }

        let query_tokens = WhitespaceTokenizer::tokenize(query);
        if query_tokens.is_empty() {
            return Err(Error::EmptyQuery);
        }
        if k == 0 {
            return Ok(Vec::new());
        }
        let Some(index) = &self.index else {
            return Ok(Vec::new());
        };

        let query_embedding = index.embedder.embed(&query_tokens.join(" "));
        let mut hits: Vec<ScoredDocument<String>> = index.scorer.matches(&query_embedding);
        hits.retain(|h| h.score >= self.cfg.min_score);
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(k);

        let results = hits
            .into_iter()
            .filter_map(|hit| {
                let entry = self.docs.get(&hit.id)?;
                Some(SearchResult::new(
                    hit.id.clone(),
                    entry.path.clone(),
                    preview(&entry.tokens.join(" ")),
                    hit.score,
                    SearchOrigin::Lexical,
                ))
            })
            .collect();
        Ok(results)
    }

    /// Persist the artifact and the token cache atomically (temp + rename).
    pub fn save(&self) -> Result<()> {
        let artifact = LexicalArtifact {
            version: ARTIFACT_VERSION,
            k1: self.cfg.k1,
            b: self.cfg.b,
            doc_ids: self.docs.keys().cloned().collect(),
            docs: self.docs.clone(),
            document_count: self.docs.len(),
        };
        write_atomic(&self.index_path, &serde_json::to_vec(&artifact)?)?;
        write_atomic(&self.cache_path, &serde_json::to_vec(&self.cache)?)?;
        info!(
            docs = self.docs.len(),
            path = %self.index_path.display(),
            "lexical index saved"
        );
        Ok(())
    }

    /// Load the persisted artifact. The payload is parsed and version-checked
    /// in full before any state is replaced, so a failed load never swaps
    /// good state for nothing.
    pub fn load(&mut self) -> Result<()> {
        let bytes = fs::read(&self.index_path).map_err(|e| Error::Load {
            path: self.index_path.clone(),
            reason: e.to_string(),
        })?;
        let artifact: LexicalArtifact =
            serde_json::from_slice(&bytes).map_err(|e| Error::Load {
                path: self.index_path.clone(),
                reason: e.to_string(),
            })?;
        if artifact.version != ARTIFACT_VERSION {
            return Err(Error::Load {
                path: self.index_path.clone(),
                reason: format!("unsupported artifact version {}", artifact.version),
            });
        }

        self.docs = artifact.docs;
        self.index = None;
        self.stale = true;

        // The token cache is best-effort; a missing or corrupt cache only
        // costs re-extraction on the next scan.
        if let Ok(bytes) = fs::read(&self.cache_path) {
            if let Ok(cache) = serde_json::from_slice::<TokenCache>(&bytes) {
                self.cache = cache;
            }
        }

        info!(docs = self.docs.len(), "lexical index loaded");
        Ok(())
    }

    pub fn info(&self) -> serde_json::Value {
        serde_json::json!({
            "retriever": RETRIEVER_NAME,
            "document_count": self.docs.len(),
            "stale": self.stale,
            "has_index": self.index.is_some(),
            "parameters": { "k1": self.cfg.k1, "b": self.cfg.b },
            "score_threshold": self.cfg.min_score,
            "index_file": self.index_path,
        })
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| Error::Persist {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).map_err(|source| Error::Persist {
        path: tmp.clone(),
        source,
    })?;
    fs::rename(&tmp, path).map_err(|source| Error::Persist {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_doc(id: &str, text: &str) -> Document {
        Document::new(
            id.to_string(),
            PathBuf::from(id),
            text.to_string(),
            text.len() as u64,
            format!("{:016x}", xxhash_rust::xxh3::xxh3_64(text.as_bytes())),
        )
    }

    fn retriever(dir: &Path) -> LexicalRetriever {
        LexicalRetriever::new(
            LexicalConfig::default(),
            dir.join("lexical_index.json"),
            dir.join("token_cache.json"),
        )
    }

    #[test]
    fn tokenizer_is_lowercase_whitespace_split() {
        assert_eq!(
            WhitespaceTokenizer::tokenize("  Apple\tBanana  cherry\n"),
            vec!["apple", "banana", "cherry"]
        );
        assert!(WhitespaceTokenizer::tokenize("   \n\t ").is_empty());
    }

    #[test]
    fn add_then_search_finds_the_document() {
        let dir = tempfile::tempdir().unwrap();
        let mut lex = retriever(dir.path());
        lex.add(&make_doc("/docs/a.txt", "apple apple banana")).unwrap();
        lex.add(&make_doc("/docs/b.txt", "orange pear plum")).unwrap();

        let hits = lex.search("apple", 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].doc_id, "/docs/a.txt");
        assert!(hits[0].score > 0.0);
        assert_eq!(hits[0].origin, SearchOrigin::Lexical);

        assert!(lex.search("cherry", 5).unwrap().is_empty());
    }

    #[test]
    fn empty_document_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut lex = retriever(dir.path());
        let err = lex.add(&make_doc("/docs/a.txt", "   \n ")).unwrap_err();
        assert!(matches!(err, Error::EmptyTokens(_)));
        assert_eq!(lex.document_count(), 0);
    }

    #[test]
    fn empty_query_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut lex = retriever(dir.path());
        lex.add(&make_doc("/docs/a.txt", "apple")).unwrap();
        assert!(matches!(lex.search("   ", 5), Err(Error::EmptyQuery)));
    }

    #[test]
    fn adding_twice_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut lex = retriever(dir.path());
        let doc = make_doc("/docs/a.txt", "alpha beta gamma");
        lex.add(&doc).unwrap();
        lex.add(&doc).unwrap();
        assert_eq!(lex.document_count(), 1);

        let hits = lex.search("alpha", 5).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn update_replaces_old_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let mut lex = retriever(dir.path());
        lex.add(&make_doc("/docs/c.txt", "alpha")).unwrap();
        lex.add(&make_doc("/docs/c.txt", "beta")).unwrap();

        assert!(lex.search("alpha", 5).unwrap().is_empty());
        let hits = lex.search("beta", 5).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(lex.document_count(), 1);
    }

    #[test]
    fn remove_twice_reports_nothing_removed() {
        let dir = tempfile::tempdir().unwrap();
        let mut lex = retriever(dir.path());
        lex.add(&make_doc("/docs/a.txt", "apple")).unwrap();
        assert!(lex.remove("/docs/a.txt"));
        assert!(!lex.remove("/docs/a.txt"));
        assert!(lex.search("apple", 5).unwrap().is_empty());
    }

    #[test]
    fn k_zero_returns_empty_and_large_k_returns_all() {
        let dir = tempfile::tempdir().unwrap();
        let mut lex = retriever(dir.path());
        lex.add(&make_doc("/docs/a.txt", "shared term one")).unwrap();
        lex.add(&make_doc("/docs/b.txt", "shared term two")).unwrap();

        assert!(lex.search("shared", 0).unwrap().is_empty());
        assert_eq!(lex.search("shared", 100).unwrap().len(), 2);
    }

    #[test]
    fn results_are_ordered_and_ties_break_by_doc_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut lex = retriever(dir.path());
        // Identical content ⇒ identical scores ⇒ ascending doc-id order.
        lex.add(&make_doc("/docs/b.txt", "same words here")).unwrap();
        lex.add(&make_doc("/docs/a.txt", "same words here")).unwrap();

        let hits = lex.search("same words", 5).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].doc_id, "/docs/a.txt");
        assert_eq!(hits[1].doc_id, "/docs/b.txt");
    }

    #[test]
    fn save_then_load_answers_identically() {
        let dir = tempfile::tempdir().unwrap();
        let mut lex = retriever(dir.path());
        lex.add(&make_doc("/docs/a.txt", "apple banana banana")).unwrap();
        lex.add(&make_doc("/docs/b.txt", "banana cherry")).unwrap();
        let before = lex.search("banana", 5).unwrap();
        lex.save().unwrap();

        let mut reloaded = retriever(dir.path());
        reloaded.load().unwrap();
        let after = reloaded.search("banana", 5).unwrap();

        assert_eq!(before.len(), after.len());
        for (x, y) in before.iter().zip(after.iter()) {
            assert_eq!(x.doc_id, y.doc_id);
            assert!((x.score - y.score).abs() < 1e-5);
        }
    }

    #[test]
    fn load_rejects_mismatched_versions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lexical_index.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "version": 99,
                "k1": 1.5, "b": 0.75,
                "doc_ids": [], "docs": {}, "document_count": 0
            })
            .to_string(),
        )
        .unwrap();

        let mut lex = LexicalRetriever::new(
            LexicalConfig::default(),
            path,
            dir.path().join("token_cache.json"),
        );
        assert!(matches!(lex.load(), Err(Error::Load { .. })));
    }

    #[test]
    fn failed_load_keeps_previous_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut lex = retriever(dir.path());
        lex.add(&make_doc("/docs/a.txt", "apple")).unwrap();

        // No artifact on disk yet: the load fails and the in-memory corpus
        // must survive untouched.
        assert!(lex.load().is_err());
        assert_eq!(lex.document_count(), 1);
        assert_eq!(lex.search("apple", 5).unwrap().len(), 1);
    }

    #[test]
    fn token_cache_fingerprint_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut lex = retriever(dir.path());
        let doc = make_doc("/docs/a.txt", "cached tokens here");
        lex.add(&doc).unwrap();
        lex.save().unwrap();

        let mut reloaded = retriever(dir.path());
        reloaded.load().unwrap();
        let (size, hash) = reloaded.cached_fingerprint("/docs/a.txt").unwrap();
        assert_eq!(size, doc.size);
        assert_eq!(hash, doc.content_hash);
        assert_eq!(reloaded.cached_fingerprint("/docs/missing.txt"), None);
    }
}
