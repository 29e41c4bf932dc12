use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use askcode_llm::provider::LlmProvider;
use notify_debouncer_mini::{DebouncedEventKind, new_debouncer};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::indexer::{CodeIndexer, ReindexOutcome};

const DEBOUNCE: Duration = Duration::from_secs(1);

/// Re-indexes changed files until dropped.
pub struct IndexWatcher {
    handle: tokio::task::JoinHandle<()>,
}

impl IndexWatcher {
    /// # Errors
    ///
    /// Returns `Watcher` if the filesystem watcher cannot be initialized.
    pub fn start<P: LlmProvider + 'static>(
        root: &Path,
        indexer: Arc<CodeIndexer<P>>,
    ) -> Result<Self> {
        let (notify_tx, mut notify_rx) = mpsc::channel::<PathBuf>(64);
        let source = indexer.source().clone();

        let mut debouncer = new_debouncer(
            DEBOUNCE,
            move |events: std::result::Result<
                Vec<notify_debouncer_mini::DebouncedEvent>,
                notify::Error,
            >| {
                let events = match events {
                    Ok(events) => events,
                    Err(e) => {
                        tracing::warn!("index watcher error: {e}");
                        return;
                    }
                };

                let paths: HashSet<PathBuf> = events
                    .into_iter()
                    .filter(|e| e.kind == DebouncedEventKind::Any)
                    .filter(|e| {
                        source
                            .relative_path(&e.path)
                            .is_some_and(|rel| source.accepts(&rel))
                    })
                    .map(|e| e.path)
                    .collect();

                for path in paths {
                    let _ = notify_tx.blocking_send(path);
                }
            },
        )?;

        debouncer
            .watcher()
            .watch(root, notify::RecursiveMode::Recursive)?;
        tracing::info!(root = %root.display(), "watching for changes");

        let handle = tokio::spawn(async move {
            let _debouncer = debouncer;
            while let Some(path) = notify_rx.recv().await {
                match indexer.reindex_file(&path).await {
                    Ok(ReindexOutcome::Indexed { chunks }) => {
                        tracing::info!(path = %path.display(), chunks, "change indexed");
                    }
                    Ok(ReindexOutcome::Removed) => {
                        tracing::info!(path = %path.display(), "removal indexed");
                    }
                    Ok(ReindexOutcome::Unchanged | ReindexOutcome::Skipped) => {}
                    Err(e) if e.is_store_failure() => {
                        tracing::error!(path = %path.display(), "vector store failed: {e:#}");
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), "reindex failed: {e:#}");
                    }
                }
            }
        });

        Ok(Self { handle })
    }
}

impl Drop for IndexWatcher {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
