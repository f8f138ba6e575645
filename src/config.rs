use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Config file looked up at the project root.
pub const CONFIG_FILE_NAME: &str = ".docsift.json";

/// What to watch and whether to recurse into subdirectories.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Watched document tree, absolute or relative to the project root.
    pub directory: PathBuf,
    pub recursive: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("input"),
            recursive: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractConfig {
    /// Extraction size ceiling; files larger than this are always skipped.
    pub max_file_size: u64,
    /// Wall-clock budget for a single PDF extraction.
    pub pdf_timeout_secs: u64,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            max_file_size: 10 * 1024 * 1024,
            pdf_timeout_secs: 60,
        }
    }
}

impl ExtractConfig {
    pub fn pdf_timeout(&self) -> Duration {
        Duration::from_secs(self.pdf_timeout_secs)
    }
}

/// Sliding window for vector chunking, all in characters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// Windows whose trimmed length falls below this are dropped.
    pub min_chunk: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 100,
            min_chunk: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// HuggingFace model repo ID used by Model2Vec-RS.
    pub model: String,
    /// Encode batch size.
    pub batch_size: usize,
    /// Max tokens per sequence handed to the model; `None` = model default.
    pub max_seq_len: Option<usize>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "minishlab/potion-retrieval-32M".to_string(),
            batch_size: 32,
            max_seq_len: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LexicalConfig {
    /// Term frequency saturation parameter.
    pub k1: f32,
    /// Field length normalization parameter.
    pub b: f32,
    /// Results scoring below this are discarded.
    pub min_score: f32,
}

impl Default for LexicalConfig {
    fn default() -> Self {
        Self {
            k1: 1.5,
            b: 0.75,
            min_score: 0.1,
        }
    }
}

/// Distance metric used by the ANN table, and the matching distance →
/// similarity conversion applied to raw query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    Cosine,
    L2,
    Dot,
}

impl DistanceMetric {
    pub fn to_lance(self) -> lancedb::DistanceType {
        match self {
            DistanceMetric::Cosine => lancedb::DistanceType::Cosine,
            DistanceMetric::L2 => lancedb::DistanceType::L2,
            DistanceMetric::Dot => lancedb::DistanceType::Dot,
        }
    }

    /// Map a raw distance into a similarity in [0, 1].
    pub fn similarity(self, distance: f32) -> f32 {
        match self {
            DistanceMetric::Cosine => (1.0 - distance).max(0.0),
            DistanceMetric::L2 => 1.0 / (1.0 + distance),
            DistanceMetric::Dot => (distance + 1.0) / 2.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::L2 => "l2",
            DistanceMetric::Dot => "dot",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorConfig {
    pub distance_metric: DistanceMetric,
    /// Chunks whose converted similarity falls below this are discarded.
    pub min_similarity: f32,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            distance_metric: DistanceMetric::Cosine,
            min_similarity: 0.3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Candidates requested from each retriever before fusion.
    pub per_retriever_candidates: usize,
    /// Default `k` for queries that don't specify one.
    pub final_result_count: usize,
    /// Per-retriever wall-clock cap; a laggard counts as empty for the query.
    pub search_timeout_secs: u64,
    pub enable_cache: bool,
    pub cache_ttl_secs: u64,
    /// Run the two retriever searches concurrently.
    pub parallel: bool,
    /// Minimum interval between on-disk artifact freshness checks.
    pub index_check_interval_secs: u64,
    /// RRF smoothing constant.
    pub rrf_k: f32,
    /// Fused results scoring below this are discarded.
    pub rrf_min_score: f32,
    pub normalize_weights: bool,
    /// Per-list input cap into fusion.
    pub max_input: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            per_retriever_candidates: 20,
            final_result_count: 10,
            search_timeout_secs: 30,
            enable_cache: true,
            cache_ttl_secs: 60,
            parallel: true,
            index_check_interval_secs: 5,
            rrf_k: 60.0,
            rrf_min_score: 0.001,
            normalize_weights: true,
            max_input: 1000,
        }
    }
}

impl SearchConfig {
    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.search_timeout_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn index_check_interval(&self) -> Duration {
        Duration::from_secs(self.index_check_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Directory holding every persisted artifact, absolute or relative to
    /// the project root: the lexical index file, the token cache, and the
    /// vector store's own directory.
    pub dir: PathBuf,
    pub autosave: bool,
    pub autosave_interval_secs: u64,
    /// Bound on concurrent ingest tasks during the initial bulk scan.
    pub max_workers: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".docsift"),
            autosave: true,
            autosave_interval_secs: 300,
            max_workers: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    /// Debounce window: a burst of events per path collapses to one ingest
    /// this long after the last event.
    pub rebuild_delay_ms: u64,
    /// Per-artifact cooldown for the query-side reload watcher.
    pub cooldown_secs: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            rebuild_delay_ms: 500,
            cooldown_secs: 2,
        }
    }
}

impl WatcherConfig {
    pub fn rebuild_delay(&self) -> Duration {
        Duration::from_millis(self.rebuild_delay_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub watch: WatchConfig,
    pub extract: ExtractConfig,
    pub chunk: ChunkConfig,
    pub embedding: EmbeddingConfig,
    pub lexical: LexicalConfig,
    pub vector: VectorConfig,
    pub search: SearchConfig,
    pub index: IndexConfig,
    pub watcher: WatcherConfig,
}

impl Config {
    pub fn watch_dir(&self, root: &Path) -> PathBuf {
        resolve(root, &self.watch.directory)
    }

    pub fn index_dir(&self, root: &Path) -> PathBuf {
        resolve(root, &self.index.dir)
    }

    pub fn lexical_index_path(&self, root: &Path) -> PathBuf {
        self.index_dir(root).join("lexical_index.json")
    }

    pub fn token_cache_path(&self, root: &Path) -> PathBuf {
        self.index_dir(root).join("token_cache.json")
    }

    pub fn vector_db_dir(&self, root: &Path) -> PathBuf {
        self.index_dir(root).join("db")
    }

    /// Reject parameter combinations the rest of the system assumes away.
    pub fn validate(&self) -> Result<()> {
        if self.chunk.chunk_size == 0 {
            return Err(Error::ConfigInvalid("chunk_size must be positive".into()));
        }
        if self.chunk.chunk_overlap >= self.chunk.chunk_size {
            return Err(Error::ConfigInvalid(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                self.chunk.chunk_overlap, self.chunk.chunk_size
            )));
        }
        if self.chunk.min_chunk == 0 {
            return Err(Error::ConfigInvalid("min_chunk must be positive".into()));
        }
        if !(self.lexical.k1 > 0.0 && self.lexical.k1 <= 10.0) {
            return Err(Error::ConfigInvalid(format!("bm25 k1 out of range: {}", self.lexical.k1)));
        }
        if !(0.0..=1.0).contains(&self.lexical.b) {
            return Err(Error::ConfigInvalid(format!("bm25 b out of range: {}", self.lexical.b)));
        }
        if self.search.final_result_count == 0 {
            return Err(Error::ConfigInvalid("final_result_count must be positive".into()));
        }
        if self.search.per_retriever_candidates == 0 {
            return Err(Error::ConfigInvalid(
                "per_retriever_candidates must be positive".into(),
            ));
        }
        if self.embedding.batch_size == 0 {
            return Err(Error::ConfigInvalid("embedding batch_size must be positive".into()));
        }
        if self.index.max_workers == 0 {
            return Err(Error::ConfigInvalid("max_workers must be positive".into()));
        }
        Ok(())
    }
}

fn resolve(root: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        root.join(p)
    }
}

/// Load `.docsift.json` from the project root. A missing file yields the
/// defaults; an unreadable one is a startup-fatal configuration error.
pub fn load_config(root: &Path) -> Result<Config> {
    let primary = root.join(CONFIG_FILE_NAME);

    let text = match std::fs::read_to_string(&primary) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Config::default()),
        Err(e) => return Err(Error::ConfigInvalid(format!("{}: {e}", primary.display()))),
    };

    serde_json::from_str::<Config>(&text)
        .map_err(|e| Error::ConfigInvalid(format!("{}: {e}", primary.display())))
}
