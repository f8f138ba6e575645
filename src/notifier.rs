use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::engine::QueryEngine;
use crate::error::Result;

type Listener = Box<dyn Fn(&str) + Send + Sync>;

/// Push half of index-change notification: the indexer invokes every
/// registered listener synchronously after a retriever's artifact write
/// completes. A panicking listener is contained; it must never take down the
/// ingest path.
#[derive(Default)]
pub struct UpdateNotifier {
    listeners: Mutex<Vec<Listener>>,
}

impl UpdateNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener(&self, listener: impl Fn(&str) + Send + Sync + 'static) {
        self.lock().push(Box::new(listener));
    }

    pub fn notify_update(&self, retriever_name: &str) {
        let listeners = self.lock();
        for listener in listeners.iter() {
            let call = std::panic::AssertUnwindSafe(|| listener(retriever_name));
            if std::panic::catch_unwind(call).is_err() {
                warn!(retriever = retriever_name, "update listener panicked");
            }
        }
    }

    pub fn listener_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Listener>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Pull half: watch the persisted artifacts (the lexical index file and the
/// vector store directory) and force-reload the local query engine on
/// modify/create, with a per-artifact cooldown suppressing write bursts.
/// This is the only path that works when the indexer and the query server
/// are separate processes.
///
/// The returned watcher must stay alive for the duration of the watch.
pub fn spawn_artifact_watcher(
    engine: Arc<QueryEngine>,
    lexical_artifact: PathBuf,
    vector_db_dir: PathBuf,
    cooldown: Duration,
) -> Result<RecommendedWatcher> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let _ = tx.send(event);
            }
            Err(e) => warn!(error = %e, "artifact watch error"),
        },
        notify::Config::default(),
    )?;

    if let Some(dir) = lexical_artifact.parent() {
        if dir.is_dir() {
            watcher.watch(dir, RecursiveMode::NonRecursive)?;
            debug!(dir = %dir.display(), "watching lexical artifact directory");
        }
    }
    if vector_db_dir.is_dir() {
        watcher.watch(&vector_db_dir, RecursiveMode::Recursive)?;
        debug!(dir = %vector_db_dir.display(), "watching vector store directory");
    }

    tokio::spawn(async move {
        let mut last_reload: HashMap<&'static str, Instant> = HashMap::new();
        while let Some(event) = rx.recv().await {
            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                continue;
            }
            let key = event.paths.iter().find_map(|p| {
                if p == &lexical_artifact {
                    Some("lexical")
                } else if p.starts_with(&vector_db_dir) {
                    Some("vector")
                } else {
                    None
                }
            });
            let Some(key) = key else { continue };

            let now = Instant::now();
            if let Some(prev) = last_reload.get(key) {
                if now.duration_since(*prev) < cooldown {
                    continue;
                }
            }
            last_reload.insert(key, now);

            info!(artifact = key, "persisted index changed; reloading");
            engine.force_reload().await;
        }
    });

    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn listeners_are_invoked_in_registration_order() {
        let notifier = UpdateNotifier::new();
        let calls = Arc::new(Mutex::new(Vec::new()));

        let c = Arc::clone(&calls);
        notifier.add_listener(move |name| c.lock().unwrap().push(format!("first:{name}")));
        let c = Arc::clone(&calls);
        notifier.add_listener(move |name| c.lock().unwrap().push(format!("second:{name}")));

        notifier.notify_update("lexical");
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["first:lexical", "second:lexical"]
        );
        assert_eq!(notifier.listener_count(), 2);
    }

    #[test]
    fn panicking_listener_does_not_stop_the_rest() {
        let notifier = UpdateNotifier::new();
        let hits = Arc::new(AtomicUsize::new(0));

        notifier.add_listener(|_| panic!("bad listener"));
        let h = Arc::clone(&hits);
        notifier.add_listener(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        notifier.notify_update("vector");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
