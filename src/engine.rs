use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::lexical::{self, LexicalRetriever};
use crate::reranker::RrfReranker;
use crate::types::{RetrievalResult, SearchResult};
use crate::vector::{self, VectorRetriever};

/// Smoothing factor for the response-time moving average.
const STATS_ALPHA: f64 = 0.1;

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct SearchStats {
    pub total_searches: u64,
    pub lexical_searches: u64,
    pub vector_searches: u64,
    pub hybrid_searches: u64,
    pub average_response_secs: f64,
    pub last_search: Option<SystemTime>,
    pub index_reload_count: u64,
}

#[derive(Debug, Clone, Copy)]
enum SearchMode {
    Lexical,
    Vector,
    Hybrid,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    query: String,
    k: usize,
    w_lex: u32,
    w_vec: u32,
}

struct CacheEntry {
    at: Instant,
    results: Vec<SearchResult>,
}

struct ReloadState {
    last_check: Instant,
    /// Newest observed mtime per artifact key.
    artifact_mtimes: HashMap<&'static str, SystemTime>,
}

/// Query side of the system: fans a query out to both retrievers (in parallel
/// when enabled, each under a wall-clock timeout), fuses with RRF, caches
/// results by (query, k, weights) with a TTL, and keeps itself coherent with
/// a separately-running indexer by polling artifact mtimes between searches.
pub struct QueryEngine {
    cfg: Config,
    lexical_artifact: PathBuf,
    vector_db_dir: PathBuf,
    lexical: Arc<Mutex<LexicalRetriever>>,
    vector: Arc<Mutex<VectorRetriever>>,
    reranker: RrfReranker,
    cache: std::sync::Mutex<HashMap<CacheKey, CacheEntry>>,
    stats: std::sync::Mutex<SearchStats>,
    auto_reload: AtomicBool,
    reload_state: std::sync::Mutex<ReloadState>,
}

impl QueryEngine {
    pub fn new(
        cfg: Config,
        root: &Path,
        lexical: Arc<Mutex<LexicalRetriever>>,
        vector: Arc<Mutex<VectorRetriever>>,
    ) -> Self {
        let reranker = RrfReranker::from_config(&cfg.search);
        let lexical_artifact = cfg.lexical_index_path(root);
        let vector_db_dir = cfg.vector_db_dir(root);
        Self {
            cfg,
            lexical_artifact,
            vector_db_dir,
            lexical,
            vector,
            reranker,
            cache: std::sync::Mutex::new(HashMap::new()),
            stats: std::sync::Mutex::new(SearchStats::default()),
            auto_reload: AtomicBool::new(true),
            reload_state: std::sync::Mutex::new(ReloadState {
                last_check: Instant::now(),
                artifact_mtimes: HashMap::new(),
            }),
        }
    }

    /// Hybrid search: both retrievers, RRF fusion, cache, stats.
    pub async fn search_hybrid(
        &self,
        query: &str,
        k: usize,
        w_lex: f32,
        w_vec: f32,
    ) -> Vec<SearchResult> {
        self.maybe_reload().await;
        let started = Instant::now();
        if k == 0 {
            return Vec::new();
        }

        let key = CacheKey {
            query: query.to_string(),
            k,
            w_lex: w_lex.to_bits(),
            w_vec: w_vec.to_bits(),
        };
        if self.cfg.search.enable_cache {
            if let Some(cached) = self.cache_get(&key) {
                debug!(query, "result cache hit");
                return cached;
            }
        }

        let candidates = self.cfg.search.per_retriever_candidates;
        let (lex_results, vec_results) = self.run_both(query, candidates).await;

        let mut inputs = Vec::new();
        if !lex_results.is_empty() {
            inputs.push(RetrievalResult {
                retriever_name: lexical::RETRIEVER_NAME,
                results: lex_results,
                weight: w_lex,
            });
        }
        if !vec_results.is_empty() {
            inputs.push(RetrievalResult {
                retriever_name: vector::RETRIEVER_NAME,
                results: vec_results,
                weight: w_vec,
            });
        }

        let fused = self.reranker.rerank(&inputs, k);
        if let Some(top) = fused.first() {
            let breakdown = self.reranker.explain(&top.doc_id, &inputs);
            debug!(doc = %top.doc_id, %breakdown, "top result fusion breakdown");
        }
        if self.cfg.search.enable_cache && !fused.is_empty() {
            self.cache_put(key, fused.clone());
        }
        self.record(started, SearchMode::Hybrid);
        info!(
            query,
            results = fused.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "hybrid search complete"
        );
        fused
    }

    pub async fn search_lexical_only(&self, query: &str, k: usize) -> Vec<SearchResult> {
        self.maybe_reload().await;
        let started = Instant::now();
        let results = match self.lexical.lock().await.search(query, k) {
            Ok(results) => results,
            Err(e) => {
                debug!(query, error = %e, "lexical search returned nothing");
                Vec::new()
            }
        };
        self.record(started, SearchMode::Lexical);
        results
    }

    pub async fn search_vector_only(&self, query: &str, k: usize) -> Vec<SearchResult> {
        self.maybe_reload().await;
        let started = Instant::now();
        let results = match self.vector.lock().await.search(query, k).await {
            Ok(results) => results,
            Err(e) => {
                debug!(query, error = %e, "vector search returned nothing");
                Vec::new()
            }
        };
        self.record(started, SearchMode::Vector);
        results
    }

    async fn run_both(&self, query: &str, k: usize) -> (Vec<SearchResult>, Vec<SearchResult>) {
        let budget = self.cfg.search.search_timeout();

        if self.cfg.search.parallel {
            let lexical = Arc::clone(&self.lexical);
            let vector = Arc::clone(&self.vector);
            let lex_query = query.to_string();
            let vec_query = query.to_string();

            // Spawn both before awaiting either so they run concurrently; a
            // laggard past the timeout is recorded as empty for this query.
            let lex_task =
                tokio::spawn(async move { lexical.lock().await.search(&lex_query, k) });
            let vec_task =
                tokio::spawn(async move { vector.lock().await.search(&vec_query, k).await });

            let lex_results = match tokio::time::timeout(budget, lex_task).await {
                Ok(Ok(Ok(results))) => results,
                Ok(Ok(Err(e))) => {
                    debug!(error = %e, "lexical search returned nothing");
                    Vec::new()
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "lexical search task failed");
                    Vec::new()
                }
                Err(_) => {
                    warn!(timeout_secs = budget.as_secs(), "lexical search timed out");
                    Vec::new()
                }
            };
            let vec_results = match tokio::time::timeout(budget, vec_task).await {
                Ok(Ok(Ok(results))) => results,
                Ok(Ok(Err(e))) => {
                    debug!(error = %e, "vector search returned nothing");
                    Vec::new()
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "vector search task failed");
                    Vec::new()
                }
                Err(_) => {
                    warn!(timeout_secs = budget.as_secs(), "vector search timed out");
                    Vec::new()
                }
            };
            (lex_results, vec_results)
        } else {
            let lex_results = match tokio::time::timeout(budget, async {
                self.lexical.lock().await.search(query, k)
            })
            .await
            {
                Ok(Ok(results)) => results,
                Ok(Err(e)) => {
                    debug!(error = %e, "lexical search returned nothing");
                    Vec::new()
                }
                Err(_) => {
                    warn!("lexical search timed out");
                    Vec::new()
                }
            };
            let vec_results = match tokio::time::timeout(budget, async {
                self.vector.lock().await.search(query, k).await
            })
            .await
            {
                Ok(Ok(results)) => results,
                Ok(Err(e)) => {
                    debug!(error = %e, "vector search returned nothing");
                    Vec::new()
                }
                Err(_) => {
                    warn!("vector search timed out");
                    Vec::new()
                }
            };
            (lex_results, vec_results)
        }
    }

    /// Run all three modes for one query and report timings, counts and
    /// pairwise overlap.
    pub async fn compare(&self, query: &str, k: usize) -> serde_json::Value {
        let started = Instant::now();
        let lex = self.search_lexical_only(query, k).await;
        let lex_secs = started.elapsed().as_secs_f64();

        let started = Instant::now();
        let vec = self.search_vector_only(query, k).await;
        let vec_secs = started.elapsed().as_secs_f64();

        let started = Instant::now();
        let hybrid = self.search_hybrid(query, k, 1.0, 1.0).await;
        let hybrid_secs = started.elapsed().as_secs_f64();

        let summarize = |results: &[SearchResult], secs: f64| {
            let avg = if results.is_empty() {
                0.0
            } else {
                results.iter().map(|r| r.score as f64).sum::<f64>() / results.len() as f64
            };
            serde_json::json!({
                "results_count": results.len(),
                "response_time": secs,
                "avg_score": avg,
                "top_files": results.iter().take(3).map(|r| r.file_name()).collect::<Vec<_>>(),
            })
        };

        let ids = |results: &[SearchResult]| {
            results
                .iter()
                .map(|r| r.doc_id.clone())
                .collect::<std::collections::HashSet<_>>()
        };
        let (l, v, h) = (ids(&lex), ids(&vec), ids(&hybrid));

        serde_json::json!({
            "query": query,
            "methods": {
                "lexical": summarize(&lex, lex_secs),
                "vector": summarize(&vec, vec_secs),
                "hybrid": summarize(&hybrid, hybrid_secs),
            },
            "overlap": {
                "lexical_vector": l.intersection(&v).count(),
                "lexical_hybrid": l.intersection(&h).count(),
                "vector_hybrid": v.intersection(&h).count(),
                "all_three": l.intersection(&v).filter(|d| h.contains(*d)).count(),
            },
        })
    }

    /// Summarize a result list: score statistics, per-origin and per-file-type
    /// counts, and the top entries.
    pub fn analyze_results(&self, query: &str, results: &[SearchResult]) -> serde_json::Value {
        if results.is_empty() {
            return serde_json::json!({ "query": query, "total_results": 0 });
        }

        let scores: Vec<f64> = results.iter().map(|r| r.score as f64).collect();
        let min = scores.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = scores.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        let avg = scores.iter().sum::<f64>() / scores.len() as f64;

        let mut origins: HashMap<String, usize> = HashMap::new();
        let mut file_types: HashMap<String, usize> = HashMap::new();
        for result in results {
            *origins.entry(result.origin.to_string()).or_insert(0) += 1;
            let ext = result
                .path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
                .to_ascii_lowercase();
            *file_types.entry(ext).or_insert(0) += 1;
        }

        serde_json::json!({
            "query": query,
            "total_results": results.len(),
            "score_stats": { "min_score": min, "max_score": max, "avg_score": avg },
            "origins": origins,
            "file_types": file_types,
            "top_results": results.iter().take(5).enumerate().map(|(i, r)| serde_json::json!({
                "rank": i + 1,
                "file_name": r.file_name(),
                "score": r.score,
                "origin": r.origin,
            })).collect::<Vec<_>>(),
        })
    }

    /// Reload every retriever from its persisted artifact. A retriever whose
    /// load fails keeps its previously-loaded state — good state is never
    /// replaced with nothing. The result cache is always flushed.
    pub async fn force_reload(&self) {
        info!("reloading retriever indices");
        {
            let mut lex = self.lexical.lock().await;
            if let Err(e) = lex.load() {
                warn!(error = %e, "lexical reload failed; keeping previous state");
            }
        }
        {
            let mut vec = self.vector.lock().await;
            if let Err(e) = vec.load().await {
                warn!(error = %e, "vector reload failed; keeping previous state");
            }
        }

        let flushed = {
            let mut cache = self.lock_cache();
            let n = cache.len();
            cache.clear();
            n
        };
        if flushed > 0 {
            info!(entries = flushed, "search cache flushed");
        }
        self.lock_stats().index_reload_count += 1;
    }

    pub fn set_auto_reload(&self, enabled: bool) {
        self.auto_reload.store(enabled, Ordering::Relaxed);
        info!(enabled, "auto reload");
    }

    pub fn stats(&self) -> SearchStats {
        self.lock_stats().clone()
    }

    pub fn cache_len(&self) -> usize {
        self.lock_cache().len()
    }

    /// Pull half of the reload path: at most once per `index_check_interval`,
    /// stat the persisted artifacts and reload when they moved forward. The
    /// first observation of an artifact only records its mtime — the engine
    /// has just loaded it.
    async fn maybe_reload(&self) {
        if !self.auto_reload.load(Ordering::Relaxed) {
            return;
        }

        let changed = {
            let mut state = self.lock_reload_state();
            if state.last_check.elapsed() < self.cfg.search.index_check_interval() {
                return;
            }
            state.last_check = Instant::now();

            let mut changed = false;
            if let Some(mtime) = file_mtime(&self.lexical_artifact) {
                changed |= observe(&mut state.artifact_mtimes, "lexical", mtime);
            }
            if let Some(mtime) = newest_mtime(&self.vector_db_dir) {
                changed |= observe(&mut state.artifact_mtimes, "vector", mtime);
            }
            changed
        };

        if changed {
            info!("index artifacts changed on disk");
            self.force_reload().await;
        }
    }

    fn record(&self, started: Instant, mode: SearchMode) {
        let response = started.elapsed().as_secs_f64();
        let mut stats = self.lock_stats();
        if stats.total_searches > 0 {
            stats.average_response_secs =
                STATS_ALPHA * response + (1.0 - STATS_ALPHA) * stats.average_response_secs;
        } else {
            stats.average_response_secs = response;
        }
        stats.total_searches += 1;
        match mode {
            SearchMode::Lexical => stats.lexical_searches += 1,
            SearchMode::Vector => stats.vector_searches += 1,
            SearchMode::Hybrid => stats.hybrid_searches += 1,
        }
        stats.last_search = Some(SystemTime::now());
    }

    fn cache_get(&self, key: &CacheKey) -> Option<Vec<SearchResult>> {
        let ttl = self.cfg.search.cache_ttl();
        let mut cache = self.lock_cache();
        match cache.get(key) {
            Some(entry) if entry.at.elapsed() < ttl => Some(entry.results.clone()),
            Some(_) => {
                cache.remove(key);
                None
            }
            None => None,
        }
    }

    fn cache_put(&self, key: CacheKey, results: Vec<SearchResult>) {
        let ttl = self.cfg.search.cache_ttl();
        let mut cache = self.lock_cache();
        // Bounded by TTL only: expired entries are dropped on insertion.
        cache.retain(|_, entry| entry.at.elapsed() < ttl);
        cache.insert(
            key,
            CacheEntry {
                at: Instant::now(),
                results,
            },
        );
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<CacheKey, CacheEntry>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, SearchStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_reload_state(&self) -> std::sync::MutexGuard<'_, ReloadState> {
        self.reload_state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Record `mtime` under `key`; true when it advanced past a prior observation.
fn observe(
    mtimes: &mut HashMap<&'static str, SystemTime>,
    key: &'static str,
    mtime: SystemTime,
) -> bool {
    match mtimes.get(key) {
        Some(prev) if mtime > *prev => {
            mtimes.insert(key, mtime);
            true
        }
        Some(_) => false,
        None => {
            mtimes.insert(key, mtime);
            false
        }
    }
}

fn file_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Newest mtime of any file under `dir`, recursively.
fn newest_mtime(dir: &Path) -> Option<SystemTime> {
    let mut newest: Option<SystemTime> = None;
    let entries = std::fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        let candidate = if path.is_dir() {
            newest_mtime(&path)
        } else {
            file_mtime(&path)
        };
        if let Some(t) = candidate {
            if newest.map(|n| t > n).unwrap_or(true) {
                newest = Some(t);
            }
        }
    }
    newest
}
