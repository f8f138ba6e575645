use anyhow::Result;
use serde_json::json;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;

use crate::config::{load_config, Config};
use crate::embedder::StaticModelEmbedder;
use crate::engine::QueryEngine;
use crate::extractor;
use crate::lexical::LexicalRetriever;
use crate::notifier::spawn_artifact_watcher;
use crate::vector::VectorRetriever;

const VALID_MODES: [&str; 3] = ["hybrid", "lexical", "vector"];
const MAX_RESULTS_CEILING: usize = 50;
const WEIGHT_RANGE: std::ops::RangeInclusive<f32> = 0.1..=2.0;

pub struct ServerState {
    root: PathBuf,
    cfg: Config,
    runtime: tokio::runtime::Runtime,
    /// Built lazily on the first search call so the server starts (and
    /// answers initialize / tools/list / get_file_content) without loading
    /// the embedding model.
    engine: Option<Arc<QueryEngine>>,
    /// Keeps the artifact watcher alive alongside the engine.
    _artifact_watcher: Option<notify::RecommendedWatcher>,
}

impl ServerState {
    fn new(root: PathBuf, cfg: Config) -> Result<Self> {
        let runtime = tokio::runtime::Runtime::new()?;
        Ok(Self {
            root,
            cfg,
            runtime,
            engine: None,
            _artifact_watcher: None,
        })
    }

    fn ensure_engine(&mut self) -> std::result::Result<Arc<QueryEngine>, String> {
        if let Some(engine) = &self.engine {
            return Ok(Arc::clone(engine));
        }

        let embedder = StaticModelEmbedder::load(
            &self.cfg.embedding.model,
            self.cfg.embedding.max_seq_len,
            self.cfg.embedding.batch_size,
        )
        .map_err(|e| format!("Error: embedding model initialization failed: {e}"))?;

        let mut lexical = LexicalRetriever::new(
            self.cfg.lexical.clone(),
            self.cfg.lexical_index_path(&self.root),
            self.cfg.token_cache_path(&self.root),
        );
        if let Err(e) = lexical.load() {
            // LoadFailed at startup falls back to an empty index; the pull
            // watcher picks up the artifact once the indexer writes it.
            tracing::warn!(error = %e, "no lexical artifact yet; starting empty");
        }

        let mut vector = VectorRetriever::new(
            self.cfg.vector_db_dir(&self.root),
            Arc::new(embedder),
            self.cfg.chunk.clone(),
            self.cfg.vector.clone(),
        );
        self.runtime
            .block_on(vector.initialize())
            .map_err(|e| format!("Error: vector store initialization failed: {e}"))?;

        let engine = Arc::new(QueryEngine::new(
            self.cfg.clone(),
            &self.root,
            Arc::new(Mutex::new(lexical)),
            Arc::new(Mutex::new(vector)),
        ));

        // Cross-process reload: watch the persisted artifacts.
        let _guard = self.runtime.enter();
        match spawn_artifact_watcher(
            Arc::clone(&engine),
            self.cfg.lexical_index_path(&self.root),
            self.cfg.vector_db_dir(&self.root),
            self.cfg.watcher.cooldown(),
        ) {
            Ok(watcher) => self._artifact_watcher = Some(watcher),
            Err(e) => tracing::warn!(error = %e, "artifact watcher unavailable; relying on periodic checks"),
        }

        self.engine = Some(Arc::clone(&engine));
        Ok(engine)
    }

    fn tool_list(&self, id: serde_json::Value) -> serde_json::Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": {
                "tools": [
                    {
                        "name": "hybrid_search",
                        "description": "Search the watched document tree. Combines BM25 keyword matching and chunked vector similarity with Reciprocal Rank Fusion; `mode` selects hybrid (default), lexical-only, or vector-only retrieval. Results are ranked with path, score, origin, and a text snippet.",
                        "inputSchema": {
                            "type": "object",
                            "properties": {
                                "query": { "type": "string", "description": "Search query text." },
                                "mode": { "type": "string", "enum": ["hybrid", "lexical", "vector"], "description": "Retrieval mode (default: hybrid)." },
                                "max_results": { "type": "integer", "minimum": 1, "maximum": 50, "description": "Number of results to return (default from config)." },
                                "lexical_weight": { "type": "number", "minimum": 0.1, "maximum": 2.0, "description": "Fusion weight for the BM25 list (hybrid mode, default 1.0)." },
                                "vector_weight": { "type": "number", "minimum": 0.1, "maximum": 2.0, "description": "Fusion weight for the vector list (hybrid mode, default 1.0)." }
                            },
                            "required": ["query"]
                        }
                    },
                    {
                        "name": "get_file_content",
                        "description": "Return the full extracted text of one indexed file (txt, md, or pdf). Relative paths resolve against the watched directory. Subject to the same extension and size checks as ingestion.",
                        "inputSchema": {
                            "type": "object",
                            "properties": {
                                "path": { "type": "string", "description": "File path, absolute or relative to the watched directory." }
                            },
                            "required": ["path"]
                        }
                    }
                ]
            }
        })
    }

    fn tool_call(
        &mut self,
        id: serde_json::Value,
        params: &serde_json::Value,
    ) -> serde_json::Value {
        let name = params.get("name").and_then(|n| n.as_str()).unwrap_or("");
        let args = params.get("arguments").cloned().unwrap_or(json!({}));

        let ok = |text: String| {
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "content": [{"type":"text","text": text }], "isError": false }
            })
        };
        let err = |msg: String| {
            json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "content": [{"type":"text","text": msg }], "isError": true }
            })
        };

        match name {
            "hybrid_search" => {
                let query = args
                    .get("query")
                    .and_then(|v| v.as_str())
                    .map(str::trim)
                    .unwrap_or("");
                if query.is_empty() {
                    return err("Error: search query is empty".to_string());
                }

                let mode = args.get("mode").and_then(|v| v.as_str()).unwrap_or("hybrid");
                if !VALID_MODES.contains(&mode) {
                    return err(format!(
                        "Error: invalid search mode '{mode}'. Choose one of: hybrid, lexical, vector"
                    ));
                }

                let max_results = args
                    .get("max_results")
                    .and_then(|v| v.as_u64())
                    .map(|n| n as usize)
                    .unwrap_or(self.cfg.search.final_result_count);
                if !(1..=MAX_RESULTS_CEILING).contains(&max_results) {
                    return err(format!(
                        "Error: max_results must be between 1 and {MAX_RESULTS_CEILING}"
                    ));
                }

                let w_lex = args
                    .get("lexical_weight")
                    .and_then(|v| v.as_f64())
                    .map(|w| w as f32)
                    .unwrap_or(1.0);
                let w_vec = args
                    .get("vector_weight")
                    .and_then(|v| v.as_f64())
                    .map(|w| w as f32)
                    .unwrap_or(1.0);
                if !WEIGHT_RANGE.contains(&w_lex) || !WEIGHT_RANGE.contains(&w_vec) {
                    return err("Error: weights must be between 0.1 and 2.0".to_string());
                }

                let engine = match self.ensure_engine() {
                    Ok(engine) => engine,
                    Err(msg) => return err(msg),
                };

                let started = Instant::now();
                let query_owned = query.to_string();
                let results = self.runtime.block_on(async {
                    match mode {
                        "lexical" => engine.search_lexical_only(&query_owned, max_results).await,
                        "vector" => engine.search_vector_only(&query_owned, max_results).await,
                        _ => {
                            engine
                                .search_hybrid(&query_owned, max_results, w_lex, w_vec)
                                .await
                        }
                    }
                });
                let response_time = started.elapsed().as_secs_f64();

                let body = json!({
                    "success": true,
                    "query": query,
                    "mode": mode,
                    "total_results": results.len(),
                    "response_time": (response_time * 1000.0).round() / 1000.0,
                    "results": results.iter().enumerate().map(|(i, r)| json!({
                        "rank": i + 1,
                        "path": r.path,
                        "file_name": r.file_name(),
                        "score": ((r.score as f64) * 10_000.0).round() / 10_000.0,
                        "origin": r.origin,
                        "snippet": r.snippet,
                    })).collect::<Vec<_>>(),
                });
                match serde_json::to_string_pretty(&body) {
                    Ok(text) => ok(text),
                    Err(e) => err(format!("Error: failed to encode results: {e}")),
                }
            }

            "get_file_content" => {
                let Some(path_arg) = args
                    .get("path")
                    .and_then(|v| v.as_str())
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                else {
                    return err("Error: 'path' is required".to_string());
                };

                let body = self.read_file_content(path_arg);
                match serde_json::to_string_pretty(&body) {
                    Ok(text) => ok(text),
                    Err(e) => err(format!("Error: failed to encode response: {e}")),
                }
            }

            _ => err(format!("Tool not found: {name}")),
        }
    }

    /// Domain failures (missing file, unsupported type, oversized file,
    /// failed extraction) come back as `success: false` payloads rather than
    /// protocol errors, mirroring the search tool's response shape.
    fn read_file_content(&self, path_arg: &str) -> serde_json::Value {
        let started = Instant::now();
        let fail = |path: &Path, error: String, kind: &str| {
            json!({
                "success": false,
                "path": path,
                "error": error,
                "error_kind": kind,
                "response_time": started.elapsed().as_secs_f64(),
            })
        };

        let target = resolve_path(&self.cfg.watch_dir(&self.root), path_arg);

        if !target.exists() {
            return fail(&target, "file does not exist".to_string(), "NotFound");
        }
        if !target.is_file() {
            return fail(&target, "path is not a file".to_string(), "NotFound");
        }
        if !extractor::is_supported(&target) {
            return fail(
                &target,
                format!(
                    "unsupported file type; supported: {}",
                    extractor::SUPPORTED_EXTENSIONS.join(", ")
                ),
                "Unsupported",
            );
        }
        let size = std::fs::metadata(&target).map(|m| m.len()).unwrap_or(0);
        if size > self.cfg.extract.max_file_size {
            return fail(
                &target,
                format!(
                    "file exceeds the size limit ({} > {} bytes)",
                    size, self.cfg.extract.max_file_size
                ),
                "TooLarge",
            );
        }

        let extract_cfg = self.cfg.extract.clone();
        let target_owned = target.clone();
        let content = self
            .runtime
            .block_on(async move { extractor::extract_text(&target_owned, &extract_cfg).await });
        if content.trim().is_empty() {
            return fail(&target, "no text could be extracted".to_string(), "ExtractionFailed");
        }

        json!({
            "success": true,
            "path": target,
            "file_name": target.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default(),
            "file_size": size,
            "extension": target.extension().and_then(|e| e.to_str()).unwrap_or("").to_ascii_lowercase(),
            "text_length": content.chars().count(),
            "content": content,
            "response_time": started.elapsed().as_secs_f64(),
        })
    }
}

/// Relative paths resolve against the watched directory.
fn resolve_path(watch_dir: &Path, p: &str) -> PathBuf {
    let pb = PathBuf::from(p);
    if pb.is_absolute() {
        pb
    } else {
        watch_dir.join(pb)
    }
}

pub fn run_stdio_server(root: PathBuf) -> Result<()> {
    let cfg = load_config(&root)?;
    cfg.validate()?;

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    let mut state = ServerState::new(root, cfg)?;

    for line in stdin.lock().lines() {
        let Ok(line) = line else { continue };
        if line.trim().is_empty() {
            continue;
        }

        let msg: serde_json::Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(_) => continue,
        };

        // JSON-RPC notifications have no "id" field — don't respond.
        if msg.get("id").is_none() {
            continue;
        }

        let id = msg.get("id").cloned().unwrap_or(json!(null));
        let method = msg.get("method").and_then(|m| m.as_str()).unwrap_or("");

        let reply = match method {
            "initialize" => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": msg.get("params").and_then(|p| p.get("protocolVersion")).cloned().unwrap_or(json!("2024-11-05")),
                    "capabilities": { "tools": { "listChanged": true } },
                    "serverInfo": { "name": "docsift", "version": env!("CARGO_PKG_VERSION") }
                }
            }),
            "ping" => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {}
            }),
            "tools/list" => state.tool_list(id),
            "tools/call" => {
                let params = msg.get("params").cloned().unwrap_or(json!({}));
                state.tool_call(id, &params)
            }
            // Return empty lists for resources/prompts — we don't implement them.
            "resources/list" => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "resources": [] }
            }),
            "prompts/list" => json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": { "prompts": [] }
            }),
            _ => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": format!("Method not found: {method}") }
            }),
        };

        writeln!(stdout, "{}", reply)?;
        stdout.flush()?;
    }

    Ok(())
}
