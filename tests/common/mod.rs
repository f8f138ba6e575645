use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;

use tokio::sync::Mutex;

use docsift::config::{ChunkConfig, Config};
use docsift::embedder::Embedder;
use docsift::lexical::LexicalRetriever;
use docsift::vector::VectorRetriever;

/// Deterministic bag-of-words embedder: each lowercased token hashes to one
/// of `dimension` buckets and the vector is L2-normalized. Documents sharing
/// words get high cosine similarity, which is all the pipeline tests need —
/// no model download, no network.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

impl Embedder for HashEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn encode(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimension];
        for token in text.split_whitespace() {
            let token = token.to_lowercase();
            let mut hasher = DefaultHasher::new();
            token.hash(&mut hasher);
            let idx = (hasher.finish() as usize) % self.dimension;
            v[idx] += 1.0;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut v {
                *x /= norm;
            }
        }
        v
    }

    fn encode_batch(&self, texts: &[String]) -> Vec<Vec<f32>> {
        texts.iter().map(|t| self.encode(t)).collect()
    }
}

/// Config pointed at `root/input` (watched tree) and `root/.docsift`
/// (artifacts), with small chunks so short fixture texts produce rows and an
/// always-on artifact freshness check.
pub fn test_config(root: &Path) -> Config {
    let mut cfg = Config::default();
    cfg.watch.directory = root.join("input");
    cfg.index.dir = root.join(".docsift");
    cfg.chunk = ChunkConfig {
        chunk_size: 80,
        chunk_overlap: 10,
        min_chunk: 3,
    };
    cfg.vector.min_similarity = 0.15;
    cfg.search.index_check_interval_secs = 0;
    cfg.watcher.rebuild_delay_ms = 100;
    cfg
}

pub fn lexical_retriever(cfg: &Config, root: &Path) -> Arc<Mutex<LexicalRetriever>> {
    Arc::new(Mutex::new(LexicalRetriever::new(
        cfg.lexical.clone(),
        cfg.lexical_index_path(root),
        cfg.token_cache_path(root),
    )))
}

pub async fn vector_retriever(cfg: &Config, root: &Path) -> Arc<Mutex<VectorRetriever>> {
    let mut vector = VectorRetriever::new(
        cfg.vector_db_dir(root),
        Arc::new(HashEmbedder::new(16)),
        cfg.chunk.clone(),
        cfg.vector.clone(),
    );
    vector
        .initialize()
        .await
        .expect("vector table must initialize in a temp dir");
    Arc::new(Mutex::new(vector))
}
