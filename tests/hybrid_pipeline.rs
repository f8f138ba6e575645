mod common;

use std::path::PathBuf;
use std::sync::Arc;

use docsift::engine::QueryEngine;
use docsift::manager::IndexManager;
use docsift::notifier::UpdateNotifier;
use docsift::types::SearchOrigin;

use common::{lexical_retriever, test_config, vector_retriever};

struct Pipeline {
    _dir: tempfile::TempDir,
    input: PathBuf,
    manager: Arc<IndexManager>,
    engine: Arc<QueryEngine>,
}

/// Manager and engine share the same retriever instances, i.e. the indexer
/// and querier roles coexisting in one process.
async fn pipeline() -> Pipeline {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().to_path_buf();
    let cfg = test_config(&root);
    let input = cfg.watch_dir(&root);
    std::fs::create_dir_all(&input).unwrap();

    let lexical = lexical_retriever(&cfg, &root);
    let vector = vector_retriever(&cfg, &root).await;
    let notifier = Arc::new(UpdateNotifier::new());

    let manager = Arc::new(IndexManager::new(
        cfg.clone(),
        root.clone(),
        Arc::clone(&lexical),
        Arc::clone(&vector),
        notifier,
    ));
    let engine = Arc::new(QueryEngine::new(cfg, &root, lexical, vector));
    // The engine would otherwise reload from (empty) artifacts mid-test.
    engine.set_auto_reload(false);

    Pipeline {
        _dir: dir,
        input,
        manager,
        engine,
    }
}

fn write(dir: &PathBuf, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

#[tokio::test]
async fn lexical_only_path() {
    let p = pipeline().await;
    let a = write(&p.input, "a.txt", "apple apple banana");
    p.manager.add_or_update(&a).await;

    let hits = p.engine.search_lexical_only("apple", 5).await;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].doc_id, a.canonicalize().unwrap().to_string_lossy());
    assert!(hits[0].score > 0.0);

    assert!(p.engine.search_lexical_only("cherry", 5).await.is_empty());
}

#[tokio::test]
async fn vector_only_path_returns_document_substring() {
    let p = pipeline().await;
    let content = "kittens purr softly while kittens sleep in the warm afternoon sun near the window";
    let b = write(&p.input, "b.md", content);
    p.manager.add_or_update(&b).await;

    let hits = p.engine.search_vector_only("kittens", 5).await;
    assert_eq!(hits.len(), 1);
    assert!(
        content.contains(hits[0].snippet.trim()),
        "snippet must be a substring of the source document"
    );
    assert!(hits[0].score >= 0.15);
    assert_eq!(hits[0].origin, SearchOrigin::Vector);
}

#[tokio::test]
async fn registry_and_both_indices_agree_at_quiescence() {
    let p = pipeline().await;
    for (name, text) in [
        ("one.txt", "alpha bravo charlie delta"),
        ("two.md", "echo foxtrot golf hotel"),
    ] {
        let path = write(&p.input, name, text);
        p.manager.add_or_update(&path).await;
    }

    let registry = p.manager.registry();
    assert_eq!(registry.len(), 2);
    let lexical = p.manager.lexical();
    let vector = p.manager.vector();
    for doc_id in registry.snapshot() {
        assert!(lexical.lock().await.contains(&doc_id));
        assert!(vector.lock().await.contains(&doc_id));
    }
    assert_eq!(lexical.lock().await.document_count(), 2);
    assert_eq!(vector.lock().await.document_count(), 2);
}

#[tokio::test]
async fn text_below_min_chunk_yields_no_vector_rows_and_no_registration() {
    let p = pipeline().await;
    // Two chars: tokenizes fine, but every window trims below min_chunk (3).
    let tiny = write(&p.input, "tiny.txt", "hi");
    p.manager.add_or_update(&tiny).await;

    let doc_id = tiny.canonicalize().unwrap().to_string_lossy().into_owned();
    assert!(!p.manager.vector().lock().await.contains(&doc_id));
    // Registration requires both retrievers to have accepted the doc.
    assert!(!p.manager.registry().contains(&doc_id));
}

#[tokio::test]
async fn update_path_replaces_content_and_keeps_one_entry() {
    let p = pipeline().await;
    let c = write(&p.input, "c.txt", "alpha alpha alpha");
    p.manager.add_or_update(&c).await;
    write(&p.input, "c.txt", "beta beta beta");
    p.manager.add_or_update(&c).await;

    assert!(p.engine.search_lexical_only("alpha", 5).await.is_empty());
    assert_eq!(p.engine.search_lexical_only("beta", 5).await.len(), 1);
    assert_eq!(p.manager.lexical().lock().await.document_count(), 1);
    assert_eq!(p.manager.vector().lock().await.document_count(), 1);

    let stats = p.manager.stats();
    assert_eq!(stats.files_added, 1);
    assert_eq!(stats.files_updated, 1);
}

#[tokio::test]
async fn delete_path_clears_both_indices() {
    let p = pipeline().await;
    let d = write(&p.input, "d.txt", "unique sesquipedalian content here");
    p.manager.add_or_update(&d).await;
    let doc_id = d.canonicalize().unwrap().to_string_lossy().into_owned();

    std::fs::remove_file(&d).unwrap();
    p.manager.remove_path(&d).await;

    assert!(!p.manager.lexical().lock().await.contains(&doc_id));
    assert!(!p.manager.vector().lock().await.contains(&doc_id));
    assert!(!p.manager.registry().contains(&doc_id));
    assert!(p
        .engine
        .search_hybrid("sesquipedalian", 5, 1.0, 1.0)
        .await
        .iter()
        .all(|r| r.doc_id != doc_id));
    assert_eq!(p.manager.stats().files_removed, 1);

    // Removing again is a no-op.
    p.manager.remove_path(&d).await;
    assert_eq!(p.manager.stats().files_removed, 1);
}

#[tokio::test]
async fn adding_twice_produces_the_same_state_as_adding_once() {
    let p = pipeline().await;
    let path = write(&p.input, "idem.txt", "repeatable deterministic ingest");
    p.manager.add_or_update(&path).await;
    p.manager.add_or_update(&path).await;

    assert_eq!(p.manager.registry().len(), 1);
    assert_eq!(p.manager.lexical().lock().await.document_count(), 1);
    assert_eq!(p.manager.vector().lock().await.document_count(), 1);
}

#[tokio::test]
async fn hybrid_search_fuses_and_marks_origin() {
    let p = pipeline().await;
    for (name, text) in [
        ("fruit.txt", "apple banana cherry fruit salad recipe notes"),
        ("veg.txt", "carrot potato onion roasted vegetable dinner"),
    ] {
        let path = write(&p.input, name, text);
        p.manager.add_or_update(&path).await;
    }

    let hits = p.engine.search_hybrid("apple banana", 5, 1.0, 1.0).await;
    assert!(!hits.is_empty());
    assert!(hits.iter().all(|r| r.origin == SearchOrigin::Fused));
    assert!(hits[0].doc_id.ends_with("fruit.txt"));
    assert!(hits[0].metadata.contains_key("original_score"));

    let analysis = p.engine.analyze_results("apple banana", &hits);
    assert_eq!(
        analysis.get("total_results").and_then(|v| v.as_u64()),
        Some(hits.len() as u64)
    );
    assert!(analysis.get("score_stats").is_some());

    // k = 0 short-circuits.
    assert!(p.engine.search_hybrid("apple", 0, 1.0, 1.0).await.is_empty());
    // k beyond the corpus returns what exists.
    let all = p.engine.search_hybrid("apple banana carrot", 50, 1.0, 1.0).await;
    assert!(all.len() <= 2);
}

#[tokio::test]
async fn result_cache_serves_repeat_queries_until_flushed() {
    let p = pipeline().await;
    let path = write(&p.input, "cached.txt", "memoized retrieval results");
    p.manager.add_or_update(&path).await;

    let first = p.engine.search_hybrid("memoized", 5, 1.0, 1.0).await;
    assert!(!first.is_empty());
    assert_eq!(p.engine.cache_len(), 1);

    let second = p.engine.search_hybrid("memoized", 5, 1.0, 1.0).await;
    assert_eq!(first.len(), second.len());

    // Different weights are a different cache key.
    let _ = p.engine.search_hybrid("memoized", 5, 2.0, 0.5).await;
    assert_eq!(p.engine.cache_len(), 2);

    p.engine.force_reload().await;
    assert_eq!(p.engine.cache_len(), 0);
    assert_eq!(p.engine.stats().index_reload_count, 1);
}

#[tokio::test]
async fn bulk_scan_indexes_supported_files_and_skips_the_rest() {
    let p = pipeline().await;
    write(&p.input, "one.txt", "searchable text file contents");
    write(&p.input, "two.md", "markdown document with searchable words");
    write(&p.input, "skip.rs", "fn main() {} // unsupported extension");
    std::fs::create_dir_all(p.input.join("nested")).unwrap();
    write(&p.input.join("nested"), "three.txt", "nested searchable file");

    let files = p.manager.enumerate_files();
    assert_eq!(files.len(), 3, "only supported extensions are scanned");

    let mut done = 0;
    p.manager.bulk_ingest(&files, || done += 1).await;
    assert_eq!(done, 3);
    p.manager.finalize_bulk().await;

    assert_eq!(p.manager.registry().len(), 3);
    assert_eq!(p.engine.search_lexical_only("searchable", 10).await.len(), 3);
}

#[tokio::test]
async fn search_statistics_track_modes_and_response_time() {
    let p = pipeline().await;
    let path = write(&p.input, "stats.txt", "statistics exercise document");
    p.manager.add_or_update(&path).await;

    p.engine.search_lexical_only("statistics", 5).await;
    p.engine.search_vector_only("statistics", 5).await;
    p.engine.search_hybrid("statistics", 5, 1.0, 1.0).await;

    let stats = p.engine.stats();
    assert_eq!(stats.total_searches, 3);
    assert_eq!(stats.lexical_searches, 1);
    assert_eq!(stats.vector_searches, 1);
    assert_eq!(stats.hybrid_searches, 1);
    assert!(stats.average_response_secs >= 0.0);
    assert!(stats.last_search.is_some());
}

#[tokio::test]
async fn compare_reports_all_three_methods() {
    let p = pipeline().await;
    let path = write(&p.input, "cmp.txt", "comparison target document words");
    p.manager.add_or_update(&path).await;

    let report = p.engine.compare("comparison", 5).await;
    let methods = report.get("methods").unwrap();
    for method in ["lexical", "vector", "hybrid"] {
        assert!(
            methods.get(method).unwrap().get("results_count").is_some(),
            "missing method summary: {method}"
        );
    }
    assert!(report.get("overlap").is_some());
}
