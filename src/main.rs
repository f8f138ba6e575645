use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use docsift::config::load_config;
use docsift::embedder::StaticModelEmbedder;
use docsift::engine::QueryEngine;
use docsift::error::Error;
use docsift::lexical::LexicalRetriever;
use docsift::manager::IndexManager;
use docsift::notifier::UpdateNotifier;
use docsift::server::run_stdio_server;
use docsift::vector::VectorRetriever;
use docsift::watcher::{drive_ingest, spawn_watcher, Debouncer, IngestTask};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

#[derive(Debug, Parser)]
#[command(name = "docsift")]
#[command(version)]
#[command(about = "Hybrid (BM25 + vector) search over a watched document tree")]
struct Cli {
    /// Project root holding `.docsift.json` and the index artifacts
    /// (defaults to the current directory)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build the initial indices, then watch the document tree and keep them current
    Index {
        /// Skip the initial bulk scan; only react to new filesystem events
        #[arg(long)]
        skip_initial_scan: bool,
    },
    /// Serve the query API over MCP stdio
    Mcp,
    /// Search the persisted indices; without a query, starts an interactive shell
    Search {
        query: Option<String>,
        /// hybrid, lexical, or vector
        #[arg(long, default_value = "hybrid")]
        mode: String,
        #[arg(short = 'k', long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = 1.0)]
        lexical_weight: f32,
        #[arg(long, default_value_t = 1.0)]
        vector_weight: f32,
        /// Run all three modes and print an overlap comparison instead
        #[arg(long)]
        compare: bool,
    },
}

fn main() -> Result<()> {
    // Logs go to stderr: stdout belongs to the MCP transport.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "docsift=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let root = match cli.root {
        Some(root) => root,
        None => std::env::current_dir().context("Failed to get current dir")?,
    };

    match cli.cmd {
        Command::Mcp => run_stdio_server(root),
        Command::Index { skip_initial_scan } => run_indexer(root, skip_initial_scan),
        Command::Search {
            query,
            mode,
            limit,
            lexical_weight,
            vector_weight,
            compare,
        } => run_search(root, query, mode, limit, lexical_weight, vector_weight, compare),
    }
}

/// Build the retrievers + engine against the persisted artifacts. Fatal on
/// config or model problems (nonzero exit).
fn build_engine(
    root: &PathBuf,
    runtime: &tokio::runtime::Runtime,
) -> Result<(docsift::config::Config, Arc<QueryEngine>)> {
    let cfg = load_config(root)?;
    cfg.validate()?;

    let embedder = Arc::new(StaticModelEmbedder::load(
        &cfg.embedding.model,
        cfg.embedding.max_seq_len,
        cfg.embedding.batch_size,
    )?);

    let mut lexical = LexicalRetriever::new(
        cfg.lexical.clone(),
        cfg.lexical_index_path(root),
        cfg.token_cache_path(root),
    );
    if let Err(e) = lexical.load() {
        info!(error = %e, "starting with an empty lexical index");
    }

    let mut vector = VectorRetriever::new(
        cfg.vector_db_dir(root),
        embedder,
        cfg.chunk.clone(),
        cfg.vector.clone(),
    );
    runtime.block_on(vector.initialize())?;

    let engine = Arc::new(QueryEngine::new(
        cfg.clone(),
        root,
        Arc::new(Mutex::new(lexical)),
        Arc::new(Mutex::new(vector)),
    ));
    Ok((cfg, engine))
}

fn run_indexer(root: PathBuf, skip_initial_scan: bool) -> Result<()> {
    let cfg = load_config(&root)?;
    cfg.validate()?;

    let watch_dir = cfg.watch_dir(&root);
    if !watch_dir.is_dir() {
        return Err(Error::WatchDirMissing(watch_dir).into());
    }

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let embedder = Arc::new(StaticModelEmbedder::load(
            &cfg.embedding.model,
            cfg.embedding.max_seq_len,
            cfg.embedding.batch_size,
        )?);

        let mut lexical = LexicalRetriever::new(
            cfg.lexical.clone(),
            cfg.lexical_index_path(&root),
            cfg.token_cache_path(&root),
        );
        if let Err(e) = lexical.load() {
            info!(error = %e, "starting with an empty lexical index");
        }

        let mut vector = VectorRetriever::new(
            cfg.vector_db_dir(&root),
            embedder,
            cfg.chunk.clone(),
            cfg.vector.clone(),
        );
        vector.initialize().await?;

        let notifier = Arc::new(UpdateNotifier::new());
        notifier.add_listener(|name| debug!(retriever = name, "index artifact updated"));

        let manager = Arc::new(IndexManager::new(
            cfg.clone(),
            root.clone(),
            Arc::new(Mutex::new(lexical)),
            Arc::new(Mutex::new(vector)),
            notifier,
        ));

        if !skip_initial_scan {
            let files = manager.enumerate_files();
            info!(files = files.len(), dir = %watch_dir.display(), "initial scan");
            let bar = ProgressBar::new(files.len() as u64);
            bar.set_style(
                ProgressStyle::with_template("{bar:30} {pos}/{len} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            manager.bulk_ingest(&files, || bar.inc(1)).await;
            manager.finalize_bulk().await;
            bar.finish_with_message("indexed");
            let status = manager.status(false).await;
            debug!(status = %status, "post-scan status");
        }

        let (tx, rx) = mpsc::channel::<IngestTask>(1024);
        let debouncer = Arc::new(Debouncer::new(cfg.watcher.rebuild_delay(), tx));
        let _watcher = spawn_watcher(&watch_dir, cfg.watch.recursive, Arc::clone(&debouncer))?;

        let _autosave = if cfg.index.autosave {
            Some(manager.spawn_autosave())
        } else {
            None
        };

        info!(dir = %watch_dir.display(), "watching for document changes (Ctrl+C to stop)");
        tokio::select! {
            _ = drive_ingest(Arc::clone(&manager), rx) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
            }
        }

        manager.save_all().await;
        let stats = manager.stats();
        info!(
            processed = stats.files_processed,
            added = stats.files_added,
            updated = stats.files_updated,
            removed = stats.files_removed,
            "final ingest statistics"
        );
        Ok::<(), anyhow::Error>(())
    })?;

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_search(
    root: PathBuf,
    query: Option<String>,
    mode: String,
    limit: Option<usize>,
    lexical_weight: f32,
    vector_weight: f32,
    compare: bool,
) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new()?;
    let (cfg, engine) = build_engine(&root, &runtime)?;
    let k = limit.unwrap_or(cfg.search.final_result_count);

    if let Some(query) = query {
        if compare {
            let comparison = runtime.block_on(engine.compare(&query, k));
            println!("{}", serde_json::to_string_pretty(&comparison)?);
        } else {
            run_one_query(&runtime, &engine, &query, &mode, k, lexical_weight, vector_weight);
        }
    } else {
        run_interactive(&runtime, &engine, k)?;
    }

    drop(engine);
    runtime.shutdown_timeout(Duration::from_secs(1));
    Ok(())
}

fn run_one_query(
    runtime: &tokio::runtime::Runtime,
    engine: &Arc<QueryEngine>,
    query: &str,
    mode: &str,
    k: usize,
    w_lex: f32,
    w_vec: f32,
) {
    let started = std::time::Instant::now();
    let results = runtime.block_on(async {
        match mode {
            "lexical" => engine.search_lexical_only(query, k).await,
            "vector" => engine.search_vector_only(query, k).await,
            "hybrid" => engine.search_hybrid(query, k, w_lex, w_vec).await,
            other => {
                eprintln!("unknown mode '{other}', using hybrid");
                engine.search_hybrid(query, k, w_lex, w_vec).await
            }
        }
    });
    let elapsed = started.elapsed();

    println!(
        "{} results for '{}' ({mode}, {:.3}s)",
        results.len(),
        query,
        elapsed.as_secs_f64()
    );
    for (i, result) in results.iter().enumerate() {
        println!(
            "{:2}. {} (score: {:.4}, {})",
            i + 1,
            result.file_name(),
            result.score,
            result.origin
        );
        if !result.snippet.is_empty() {
            println!("    {}", result.snippet);
        }
    }
}

/// Interactive shell. Prefix a query with `lexical:`, `vector:` or `compare:`
/// to switch mode per query; `stats` prints engine statistics; `exit` quits.
fn run_interactive(
    runtime: &tokio::runtime::Runtime,
    engine: &Arc<QueryEngine>,
    k: usize,
) -> Result<()> {
    use std::io::{BufRead, Write};

    println!("docsift interactive search");
    println!("  <query>            hybrid search");
    println!("  lexical:<query>    BM25 only");
    println!("  vector:<query>     vector only");
    println!("  compare:<query>    run all three and compare");
    println!("  stats              search statistics");
    println!("  exit               quit");

    let stdin = std::io::stdin();
    loop {
        print!("\nsearch> ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("exit") || input.eq_ignore_ascii_case("quit") {
            break;
        }
        if input.eq_ignore_ascii_case("stats") {
            println!("{}", serde_json::to_string_pretty(&engine.stats())?);
            continue;
        }

        if let Some(q) = input.strip_prefix("compare:") {
            let comparison = runtime.block_on(engine.compare(q.trim(), k));
            println!("{}", serde_json::to_string_pretty(&comparison)?);
        } else if let Some(q) = input.strip_prefix("lexical:") {
            run_one_query(runtime, engine, q.trim(), "lexical", k, 1.0, 1.0);
        } else if let Some(q) = input.strip_prefix("vector:") {
            run_one_query(runtime, engine, q.trim(), "vector", k, 1.0, 1.0);
        } else {
            let results = runtime.block_on(engine.search_hybrid(input, k, 1.0, 1.0));
            if results.is_empty() {
                println!("no results");
                continue;
            }
            for (i, result) in results.iter().enumerate() {
                println!(
                    "{:2}. {} (score: {:.4}, {})",
                    i + 1,
                    result.file_name(),
                    result.score,
                    result.origin
                );
            }
            let analysis = engine.analyze_results(input, &results);
            println!("--- analysis ---");
            println!("{}", serde_json::to_string_pretty(&analysis)?);
        }
    }

    Ok(())
}
