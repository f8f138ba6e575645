use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use ignore::WalkBuilder;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::extractor::{self, is_supported};
use crate::lexical::{self, LexicalRetriever};
use crate::notifier::UpdateNotifier;
use crate::registry::DocumentRegistry;
use crate::types::Document;
use crate::vector::{self, VectorRetriever};

#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct IngestStats {
    pub files_processed: u64,
    pub files_added: u64,
    pub files_updated: u64,
    pub files_removed: u64,
    pub last_update: Option<SystemTime>,
}

/// Owns the end-to-end ingestion contract: extract → remove → add across both
/// retrievers, registry and stats upkeep, checkpointing, and the update
/// signal to listeners. For a single doc-id ingests are serialized (at most
/// one in flight; a concurrent second event is dropped — the debouncer
/// subsumes it). Across doc-ids no ordering is guaranteed.
pub struct IndexManager {
    cfg: Config,
    root: PathBuf,
    lexical: Arc<Mutex<LexicalRetriever>>,
    vector: Arc<Mutex<VectorRetriever>>,
    registry: Arc<DocumentRegistry>,
    notifier: Arc<UpdateNotifier>,
    stats: std::sync::Mutex<IngestStats>,
    in_flight: std::sync::Mutex<HashSet<String>>,
}

impl IndexManager {
    pub fn new(
        cfg: Config,
        root: PathBuf,
        lexical: Arc<Mutex<LexicalRetriever>>,
        vector: Arc<Mutex<VectorRetriever>>,
        notifier: Arc<UpdateNotifier>,
    ) -> Self {
        Self {
            cfg,
            root,
            lexical,
            vector,
            registry: Arc::new(DocumentRegistry::new()),
            notifier,
            stats: std::sync::Mutex::new(IngestStats::default()),
            in_flight: std::sync::Mutex::new(HashSet::new()),
        }
    }

    pub fn registry(&self) -> Arc<DocumentRegistry> {
        Arc::clone(&self.registry)
    }

    pub fn lexical(&self) -> Arc<Mutex<LexicalRetriever>> {
        Arc::clone(&self.lexical)
    }

    pub fn vector(&self) -> Arc<Mutex<VectorRetriever>> {
        Arc::clone(&self.vector)
    }

    pub fn watch_dir(&self) -> PathBuf {
        self.cfg.watch_dir(&self.root)
    }

    pub fn stats(&self) -> IngestStats {
        self.lock_stats().clone()
    }

    /// Ingest one path after a create/modify event. All errors are recovered
    /// here; they never abort the pipeline.
    pub async fn add_or_update(&self, path: &Path) {
        let doc_id = canonical_doc_id(path);
        if !self.begin(&doc_id) {
            debug!(doc = %doc_id, "ingest already in flight, dropping event");
            return;
        }
        self.ingest(&doc_id, path, self.cfg.index.autosave).await;
        self.finish(&doc_id);
    }

    async fn ingest(&self, doc_id: &str, path: &Path, checkpoint: bool) {
        // Cheap pre-screen before reading the file at all.
        let size = match std::fs::metadata(path) {
            Ok(m) => m.len(),
            Err(e) => {
                debug!(doc = doc_id, error = %e, "file vanished before ingest");
                return;
            }
        };
        if size > self.cfg.extract.max_file_size {
            debug!(doc = doc_id, size, "oversized file skipped");
            return;
        }

        let Some((size, hash)) = fingerprint(path) else {
            debug!(doc = doc_id, "file unreadable, skipping");
            return;
        };
        let text = extractor::extract_text(path, &self.cfg.extract).await;
        if text.trim().is_empty() {
            debug!(doc = doc_id, "no indexable content, skipping");
            return;
        }
        let doc = Document::new(doc_id.to_string(), PathBuf::from(doc_id), text, size, hash);

        // Delete-then-insert so the last-completed event wins.
        let removed_lex = self.lexical.lock().await.remove(doc_id);
        let removed_vec = match self.vector.lock().await.remove(doc_id).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(doc = doc_id, error = %e, "vector remove failed");
                false
            }
        };
        let had_prior = removed_lex || removed_vec;

        let lex_ok = match self.lexical.lock().await.add(&doc) {
            Ok(()) => true,
            Err(e) => {
                warn!(doc = doc_id, error = %e, "lexical add failed");
                false
            }
        };
        let vec_ok = match self.vector.lock().await.add(&doc).await {
            Ok(()) => true,
            Err(e) => {
                warn!(doc = doc_id, error = %e, "vector add failed");
                false
            }
        };

        if lex_ok && vec_ok {
            self.registry.insert(doc_id);
        } else {
            // No rollback: the doc stays in whichever retriever accepted it
            // and the next successful ingest of this path converges the state.
            self.registry.remove(doc_id);
            warn!(doc = doc_id, lex_ok, vec_ok, "document in partial state until next ingest");
        }

        {
            let mut stats = self.lock_stats();
            stats.files_processed += 1;
            if lex_ok && vec_ok {
                if had_prior {
                    stats.files_updated += 1;
                } else {
                    stats.files_added += 1;
                }
            }
            stats.last_update = Some(SystemTime::now());
        }

        if checkpoint {
            self.save_all().await;
        }
    }

    /// Remove a deleted path from both retrievers.
    pub async fn remove_path(&self, path: &Path) {
        let doc_id = canonical_doc_id(path);
        if !self.begin(&doc_id) {
            debug!(doc = %doc_id, "removal already in flight, dropping event");
            return;
        }

        let removed_lex = self.lexical.lock().await.remove(&doc_id);
        let removed_vec = match self.vector.lock().await.remove(&doc_id).await {
            Ok(removed) => removed,
            Err(e) => {
                warn!(doc = %doc_id, error = %e, "vector remove failed");
                false
            }
        };

        if removed_lex || removed_vec {
            self.registry.remove(&doc_id);
            {
                let mut stats = self.lock_stats();
                stats.files_removed += 1;
                stats.last_update = Some(SystemTime::now());
            }
            info!(doc = %doc_id, "document removed from indices");
            if self.cfg.index.autosave {
                self.save_all().await;
            }
        }

        self.finish(&doc_id);
    }

    /// Checkpoint every retriever. Persist failures are non-fatal: state stays
    /// in memory and the next autosave tick retries. Listeners are notified
    /// only after a retriever's artifact write actually completed.
    pub async fn save_all(&self) {
        match self.lexical.lock().await.save() {
            Ok(()) => self.notifier.notify_update(lexical::RETRIEVER_NAME),
            Err(e) => warn!(error = %e, "lexical checkpoint failed; will retry on next tick"),
        }
        match self.vector.lock().await.save().await {
            Ok(()) => self.notifier.notify_update(vector::RETRIEVER_NAME),
            Err(e) => warn!(error = %e, "vector checkpoint failed; will retry on next tick"),
        }
    }

    /// Enumerate the watched tree: supported extensions, non-empty, within the
    /// size cap. Sorted for deterministic scan order.
    pub fn enumerate_files(&self) -> Vec<PathBuf> {
        let root = self.watch_dir();
        let mut builder = WalkBuilder::new(&root);
        builder.standard_filters(false).follow_links(false);
        if !self.cfg.watch.recursive {
            builder.max_depth(Some(1));
        }

        let mut files = Vec::new();
        for item in builder.build() {
            let Ok(dent) = item else { continue };
            if !dent.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
                continue;
            }
            let path = dent.into_path();
            if !is_supported(&path) {
                continue;
            }
            match std::fs::metadata(&path) {
                Ok(m) if m.len() > 0 && m.len() <= self.cfg.extract.max_file_size => {
                    files.push(path);
                }
                _ => {}
            }
        }
        files.sort();
        files
    }

    /// Bulk-ingest with a bounded worker pool. Files whose token-cache
    /// fingerprint still matches the disk content and that are present in
    /// both retrievers are skipped without re-extraction (cold-start path).
    /// `on_done` runs on the caller's task once per file, in spawn order.
    pub async fn bulk_ingest<F>(self: &Arc<Self>, files: &[PathBuf], mut on_done: F) -> usize
    where
        F: FnMut(),
    {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.cfg.index.max_workers.max(1)));
        let mut handles = Vec::with_capacity(files.len());

        for path in files {
            let doc_id = canonical_doc_id(path);
            if self.is_fresh(&doc_id, path).await {
                debug!(doc = %doc_id, "token cache fresh, skipping re-extraction");
                self.registry.insert(&doc_id);
                handles.push(None);
                continue;
            }

            let mgr = Arc::clone(self);
            let path = path.clone();
            let semaphore = Arc::clone(&semaphore);
            handles.push(Some(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return;
                };
                if mgr.begin(&doc_id) {
                    mgr.ingest(&doc_id, &path, false).await;
                    mgr.finish(&doc_id);
                }
            })));
        }

        let mut ingested = 0usize;
        for handle in handles {
            if let Some(handle) = handle {
                if handle.await.is_ok() {
                    ingested += 1;
                }
            }
            on_done();
        }
        ingested
    }

    /// One rebuild + checkpoint after bulk ingest finishes.
    pub async fn finalize_bulk(&self) {
        self.lexical.lock().await.rebuild();
        self.save_all().await;
        let stats = self.stats();
        info!(
            added = stats.files_added,
            updated = stats.files_updated,
            registered = self.registry.len(),
            "initial scan complete"
        );
    }

    async fn is_fresh(&self, doc_id: &str, path: &Path) -> bool {
        let Ok(meta) = std::fs::metadata(path) else {
            return false;
        };
        let cached = self.lexical.lock().await.cached_fingerprint(doc_id);
        let Some((cached_size, cached_hash)) = cached else {
            return false;
        };
        // Size is the free pre-screen; hash only when it matches.
        if cached_size != meta.len() {
            return false;
        }
        let Some((_, hash)) = fingerprint(path) else {
            return false;
        };
        if hash != cached_hash {
            return false;
        }
        let in_lexical = self.lexical.lock().await.contains(doc_id);
        let in_vector = self.vector.lock().await.contains(doc_id);
        in_lexical && in_vector
    }

    /// Periodic checkpoint loop; runs until the task is dropped.
    pub fn spawn_autosave(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mgr = Arc::clone(self);
        let period = Duration::from_secs(self.cfg.index.autosave_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await; // immediate first tick
            loop {
                ticker.tick().await;
                debug!("autosave tick");
                mgr.save_all().await;
            }
        })
    }

    /// Status snapshot for the CLI and callers composing server status.
    pub async fn status(&self, watching: bool) -> serde_json::Value {
        let lexical_info = self.lexical.lock().await.info();
        let vector_info = self.vector.lock().await.info();
        serde_json::json!({
            "is_watching": watching,
            "auto_save_enabled": self.cfg.index.autosave,
            "processing_queue_size": self.lock_in_flight().len(),
            "registered_documents": self.registry.len(),
            "retrievers": {
                lexical::RETRIEVER_NAME: lexical_info,
                vector::RETRIEVER_NAME: vector_info,
            },
            "statistics": self.stats(),
            "config_summary": {
                "watch_directory": self.watch_dir(),
                "supported_extensions": extractor::SUPPORTED_EXTENSIONS,
                "recursive_watch": self.cfg.watch.recursive,
                "max_workers": self.cfg.index.max_workers,
            },
        })
    }

    fn begin(&self, doc_id: &str) -> bool {
        self.lock_in_flight().insert(doc_id.to_string())
    }

    fn finish(&self, doc_id: &str) {
        self.lock_in_flight().remove(doc_id);
    }

    fn lock_stats(&self) -> std::sync::MutexGuard<'_, IngestStats> {
        self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// xxh3 fingerprint of the raw file bytes: (size, hex digest).
pub fn fingerprint(path: &Path) -> Option<(u64, String)> {
    let bytes = std::fs::read(path).ok()?;
    let hash = format!("{:016x}", xxhash_rust::xxh3::xxh3_64(&bytes));
    Some((bytes.len() as u64, hash))
}

/// The doc-id is the canonicalized absolute path. Deleted files cannot be
/// canonicalized, so the parent directory is resolved instead and the file
/// name re-attached — giving add and remove events the same key.
pub fn canonical_doc_id(path: &Path) -> String {
    if let Ok(resolved) = path.canonicalize() {
        return resolved.to_string_lossy().into_owned();
    }
    match (path.parent(), path.file_name()) {
        (Some(dir), Some(name)) => dir
            .canonicalize()
            .map(|d| d.join(name))
            .unwrap_or_else(|_| path.to_path_buf())
            .to_string_lossy()
            .into_owned(),
        _ => path.to_string_lossy().into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doc_id_is_stable_across_add_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("doc.txt");
        std::fs::write(&file, "hello").unwrap();

        let while_present = canonical_doc_id(&file);
        std::fs::remove_file(&file).unwrap();
        let after_delete = canonical_doc_id(&file);
        assert_eq!(while_present, after_delete);
    }

    #[test]
    fn fingerprint_tracks_content_not_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("doc.txt");
        std::fs::write(&file, "hello").unwrap();
        let a = fingerprint(&file).unwrap();

        // Rewrite identical bytes: same fingerprint regardless of timestamps.
        std::fs::write(&file, "hello").unwrap();
        assert_eq!(a, fingerprint(&file).unwrap());

        std::fs::write(&file, "hello!").unwrap();
        assert_ne!(a, fingerprint(&file).unwrap());
    }
}
