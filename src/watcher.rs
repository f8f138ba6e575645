use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::extractor::is_supported;
use crate::manager::IndexManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    Created,
    Modified,
    Deleted,
}

/// A debounced, ready-to-run unit of ingestion work.
#[derive(Debug, Clone)]
pub struct IngestTask {
    pub path: PathBuf,
    pub kind: FileEventKind,
}

/// Collapses bursts of file events into one ingest task per path. Any
/// created/modified event (re)arms that path's timer; a deleted event cancels
/// a pending add and arms a deletion timer instead. When a timer fires the
/// task is dispatched and the per-path state cleared, so editors that write a
/// file five times per save cost one ingest with latency bounded by `delay`.
pub struct Debouncer {
    delay: Duration,
    pending: Arc<Mutex<HashMap<PathBuf, tokio::task::JoinHandle<()>>>>,
    tx: mpsc::Sender<IngestTask>,
}

impl Debouncer {
    pub fn new(delay: Duration, tx: mpsc::Sender<IngestTask>) -> Self {
        Self {
            delay,
            pending: Arc::new(Mutex::new(HashMap::new())),
            tx,
        }
    }

    /// Replace any pending timer for `path` with a fresh one. Timer
    /// replacement is atomic under the pending-map lock.
    pub fn handle_event(&self, path: PathBuf, kind: FileEventKind) {
        let mut pending = self.lock_pending();
        if let Some(previous) = pending.remove(&path) {
            previous.abort();
        }

        let delay = self.delay;
        let tx = self.tx.clone();
        let map = Arc::clone(&self.pending);
        let key = path.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            map.lock().unwrap_or_else(|e| e.into_inner()).remove(&key);
            if tx.send(IngestTask { path: key, kind }).await.is_err() {
                debug!("ingest channel closed, dropping task");
            }
        });
        pending.insert(path, handle);
    }

    pub fn pending_len(&self) -> usize {
        self.lock_pending().len()
    }

    fn lock_pending(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<PathBuf, tokio::task::JoinHandle<()>>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Watch `root` and feed normalized events into the debouncer. The returned
/// watcher must stay alive for the duration of the watch. Directory events
/// and unsupported extensions are filtered out before debouncing.
pub fn spawn_watcher(
    root: &Path,
    recursive: bool,
    debouncer: Arc<Debouncer>,
) -> Result<RecommendedWatcher> {
    let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<Event>();

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let _ = raw_tx.send(event);
            }
            Err(e) => warn!(error = %e, "filesystem watch error"),
        },
        notify::Config::default(),
    )?;

    let mode = if recursive {
        RecursiveMode::Recursive
    } else {
        RecursiveMode::NonRecursive
    };
    watcher.watch(root, mode)?;
    debug!(root = %root.display(), recursive, "filesystem watch started");

    tokio::spawn(async move {
        while let Some(event) = raw_rx.recv().await {
            for (path, kind) in normalize_event(event) {
                if !is_supported(&path) {
                    continue;
                }
                debouncer.handle_event(path, kind);
            }
        }
    });

    Ok(watcher)
}

/// Map a raw notify event onto zero or more (path, kind) pairs. Renames count
/// as a deletion of the old path and a creation of the new one.
fn normalize_event(event: Event) -> Vec<(PathBuf, FileEventKind)> {
    use notify::event::{ModifyKind, RenameMode};

    match event.kind {
        EventKind::Create(_) => event
            .paths
            .into_iter()
            .map(|p| (p, FileEventKind::Created))
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .into_iter()
            .map(|p| (p, FileEventKind::Deleted))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => event
            .paths
            .into_iter()
            .map(|p| (p, FileEventKind::Deleted))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event
            .paths
            .into_iter()
            .map(|p| (p, FileEventKind::Created))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            if event.paths.len() >= 2 {
                vec![
                    (event.paths[0].clone(), FileEventKind::Deleted),
                    (event.paths[1].clone(), FileEventKind::Created),
                ]
            } else {
                event
                    .paths
                    .into_iter()
                    .map(|p| (p, FileEventKind::Modified))
                    .collect()
            }
        }
        EventKind::Modify(_) => event
            .paths
            .into_iter()
            .map(|p| (p, FileEventKind::Modified))
            .collect(),
        _ => Vec::new(),
    }
}

/// Consume debounced tasks and dispatch them to the manager. Each task runs
/// on its own spawned task; the manager's in-flight set keeps at most one
/// ingest per doc-id.
pub async fn drive_ingest(manager: Arc<IndexManager>, mut rx: mpsc::Receiver<IngestTask>) {
    while let Some(task) = rx.recv().await {
        let mgr = Arc::clone(&manager);
        tokio::spawn(async move {
            match task.kind {
                FileEventKind::Created | FileEventKind::Modified => {
                    mgr.add_or_update(&task.path).await;
                }
                FileEventKind::Deleted => {
                    mgr.remove_path(&task.path).await;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout};

    const SHORT: Duration = Duration::from_millis(40);

    #[tokio::test]
    async fn burst_of_events_yields_one_task() {
        let (tx, mut rx) = mpsc::channel(16);
        let debouncer = Debouncer::new(SHORT, tx);
        let path = PathBuf::from("/w/a.txt");

        for _ in 0..5 {
            debouncer.handle_event(path.clone(), FileEventKind::Modified);
            sleep(Duration::from_millis(5)).await;
        }

        let task = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("task within deadline")
            .expect("channel open");
        assert_eq!(task.path, path);
        assert_eq!(task.kind, FileEventKind::Modified);

        // No second task for the same burst.
        sleep(SHORT * 3).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(debouncer.pending_len(), 0);
    }

    #[tokio::test]
    async fn delete_cancels_pending_add() {
        let (tx, mut rx) = mpsc::channel(16);
        let debouncer = Debouncer::new(SHORT, tx);
        let path = PathBuf::from("/w/b.txt");

        debouncer.handle_event(path.clone(), FileEventKind::Created);
        debouncer.handle_event(path.clone(), FileEventKind::Deleted);

        let task = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("task within deadline")
            .expect("channel open");
        assert_eq!(task.kind, FileEventKind::Deleted);

        sleep(SHORT * 3).await;
        assert!(rx.try_recv().is_err(), "the cancelled add must not fire");
    }

    #[tokio::test]
    async fn distinct_paths_debounce_independently() {
        let (tx, mut rx) = mpsc::channel(16);
        let debouncer = Debouncer::new(SHORT, tx);

        debouncer.handle_event(PathBuf::from("/w/a.txt"), FileEventKind::Modified);
        debouncer.handle_event(PathBuf::from("/w/b.txt"), FileEventKind::Modified);

        let mut seen = Vec::new();
        for _ in 0..2 {
            let task = timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("task within deadline")
                .expect("channel open");
            seen.push(task.path);
        }
        seen.sort();
        assert_eq!(seen, vec![PathBuf::from("/w/a.txt"), PathBuf::from("/w/b.txt")]);
    }

    #[test]
    fn normalize_maps_rename_to_delete_plus_create() {
        use notify::event::{ModifyKind, RenameMode};
        let event = Event {
            kind: EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            paths: vec![PathBuf::from("/w/old.txt"), PathBuf::from("/w/new.txt")],
            attrs: Default::default(),
        };
        let mapped = normalize_event(event);
        assert_eq!(
            mapped,
            vec![
                (PathBuf::from("/w/old.txt"), FileEventKind::Deleted),
                (PathBuf::from("/w/new.txt"), FileEventKind::Created),
            ]
        );
    }

    #[test]
    fn normalize_ignores_access_events() {
        let event = Event {
            kind: EventKind::Access(notify::event::AccessKind::Any),
            paths: vec![PathBuf::from("/w/a.txt")],
            attrs: Default::default(),
        };
        assert!(normalize_event(event).is_empty());
    }
}
