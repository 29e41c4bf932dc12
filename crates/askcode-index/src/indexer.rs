//! Project indexing orchestrator: walk → chunk → embed → store, tracked by the manifest.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use askcode_llm::provider::LlmProvider;
use askcode_llm::retry::retry_with_backoff;

use crate::chunker::{ChunkerConfig, chunk_file};
use crate::collection::CodeCollection;
use crate::context::contextualize_for_embedding;
use crate::embedder::Embedder;
use crate::error::{IndexError, Result};
use crate::loader::{FileRecord, FileSource};
use crate::lock::StoreLock;
use crate::manifest::{IndexStatus, Manifest};
use crate::summary::SummaryCache;

pub const LOCK_FILE: &str = "store.lock";

#[derive(Debug, Clone)]
pub struct IndexerConfig {
    pub chunker: ChunkerConfig,
    /// Retries for a file's embedding request after a transient failure.
    pub max_retries: u32,
    pub retry_backoff: Duration,
    /// Wall-clock limit for one pass; `None` means unbounded.
    pub time_budget: Option<Duration>,
    pub lock_timeout: Duration,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            chunker: ChunkerConfig::default(),
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
            time_budget: None,
            lock_timeout: Duration::from_secs(30),
        }
    }
}

/// Summary of an indexing run.
#[derive(Debug, Default, Clone)]
pub struct IndexReport {
    pub files_scanned: usize,
    pub files_indexed: usize,
    pub files_unchanged: usize,
    pub files_failed: usize,
    pub files_removed: usize,
    pub chunks_created: usize,
    pub chunks_removed: usize,
    pub errors: Vec<String>,
    /// The pass stopped early; the next run picks up where it left off.
    pub budget_exhausted: bool,
    pub duration_ms: u64,
}

impl fmt::Display for IndexReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scanned {} files: {} indexed, {} unchanged, {} failed, {} removed; \
             {} chunks created, {} removed in {}ms",
            self.files_scanned,
            self.files_indexed,
            self.files_unchanged,
            self.files_failed,
            self.files_removed,
            self.chunks_created,
            self.chunks_removed,
            self.duration_ms,
        )?;
        if self.budget_exhausted {
            write!(f, " (time budget exhausted, run again to continue)")?;
        }
        Ok(())
    }
}

/// Result of re-indexing one path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReindexOutcome {
    Indexed { chunks: usize },
    Unchanged,
    /// The file is gone or no longer indexable; its entries were removed.
    Removed,
    /// Outside the project or filtered out, and never indexed.
    Skipped,
}

pub struct CodeIndexer<P: LlmProvider> {
    source: FileSource,
    chat_dir: PathBuf,
    collection: Arc<CodeCollection>,
    embedder: Embedder<P>,
    summaries: Option<Arc<SummaryCache<P>>>,
    config: IndexerConfig,
    pass: tokio::sync::Mutex<()>,
}

impl<P: LlmProvider> CodeIndexer<P> {
    #[must_use]
    pub fn new(
        source: FileSource,
        chat_dir: impl Into<PathBuf>,
        collection: Arc<CodeCollection>,
        embedder: Embedder<P>,
        config: IndexerConfig,
    ) -> Self {
        Self {
            source,
            chat_dir: chat_dir.into(),
            collection,
            embedder,
            summaries: None,
            config,
            pass: tokio::sync::Mutex::new(()),
        }
    }

    /// Prefix embedded chunk text with the owning file's cached summary.
    #[must_use]
    pub fn with_summaries(mut self, summaries: Arc<SummaryCache<P>>) -> Self {
        self.summaries = Some(summaries);
        self
    }

    #[must_use]
    pub fn source(&self) -> &FileSource {
        &self.source
    }

    #[must_use]
    pub fn collection(&self) -> &Arc<CodeCollection> {
        &self.collection
    }

    fn lock_path(&self) -> PathBuf {
        self.chat_dir.join(LOCK_FILE)
    }

    fn budget_spent(&self, start: Instant) -> bool {
        self.config
            .time_budget
            .is_some_and(|budget| start.elapsed() >= budget)
    }

    /// Incremental pass over the whole project.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the store lock cannot be taken, or the
    /// first store or manifest failure, which aborts the pass. Embedding
    /// failures only skip the affected file.
    pub async fn index_project(&self) -> Result<IndexReport> {
        let _pass = self.pass.lock().await;
        let _lock = StoreLock::acquire(self.lock_path(), self.config.lock_timeout).await?;
        self.collection.refresh().await?;
        let start = Instant::now();
        let mut report = IndexReport::default();

        let mut manifest = Manifest::load(&self.chat_dir, self.collection.source_name())?;
        if manifest.status == IndexStatus::Indexing {
            tracing::info!("resuming interrupted indexing pass");
        }
        manifest.set_status(IndexStatus::Indexing)?;
        tracing::info!(collection = self.collection.name(), "indexing started");

        let mut seen: HashSet<String> = HashSet::new();
        for record in self.source.walk() {
            if self.budget_spent(start) {
                report.budget_exhausted = true;
                break;
            }
            report.files_scanned += 1;
            seen.insert(record.path.clone());

            if manifest.is_unchanged(&record.path, &record.fingerprint) {
                report.files_unchanged += 1;
                continue;
            }

            match self.index_record(&record, &mut manifest).await {
                Ok(created) => {
                    report.files_indexed += 1;
                    report.chunks_created += created;
                    tracing::info!(
                        file = %record.path,
                        progress = report.files_scanned,
                        created,
                    );
                }
                Err(IndexError::EmbeddingBackend(e)) => {
                    tracing::warn!(file = %record.path, "embedding failed, skipping file: {e}");
                    report.files_failed += 1;
                    report.errors.push(format!("{}: {e}", record.path));
                }
                Err(e) => {
                    tracing::error!(file = %record.path, "indexing aborted: {e}");
                    return Err(e);
                }
            }
        }

        if !report.budget_exhausted {
            self.remove_vanished(&seen, &mut manifest, &mut report, start)
                .await;
        }

        report.duration_ms = start.elapsed().as_millis().try_into().unwrap_or(u64::MAX);
        if report.budget_exhausted {
            tracing::warn!(
                scanned = report.files_scanned,
                "time budget exhausted, index left partially updated"
            );
        } else {
            manifest.set_status(IndexStatus::Ready)?;
        }
        tracing::info!(
            indexed = report.files_indexed,
            unchanged = report.files_unchanged,
            failed = report.files_failed,
            removed = report.files_removed,
            duration_ms = report.duration_ms,
            "indexing finished"
        );
        Ok(report)
    }

    async fn remove_vanished(
        &self,
        seen: &HashSet<String>,
        manifest: &mut Manifest,
        report: &mut IndexReport,
        start: Instant,
    ) {
        let vanished: Vec<String> = manifest
            .files
            .keys()
            .filter(|path| !seen.contains(*path))
            .cloned()
            .collect();

        for path in vanished {
            if self.budget_spent(start) {
                report.budget_exhausted = true;
                return;
            }
            let abs = self.source.root().join(&path);
            if abs.exists() && self.source.load(&abs).is_err() {
                // Unreadable right now; keep its entries until it can be read again.
                continue;
            }
            match self.remove_entries(&path, manifest).await {
                Ok(chunks) => {
                    report.files_removed += 1;
                    report.chunks_removed += chunks;
                    tracing::info!(file = %path, chunks, "removed deleted file");
                }
                Err(e) => {
                    tracing::warn!(file = %path, "failed to remove entries: {e}");
                    report.errors.push(format!("remove {path}: {e}"));
                }
            }
        }
    }

    async fn remove_entries(&self, path: &str, manifest: &mut Manifest) -> Result<usize> {
        self.collection.remove_file(path).await?;
        Ok(manifest.forget(path)?.map_or(0, |e| e.chunk_count))
    }

    /// Chunk, embed, and store one file. The manifest entry is dropped before
    /// the old entries are removed and rewritten only after the upsert, so an
    /// interrupted file is always re-indexed.
    async fn index_record(&self, record: &FileRecord, manifest: &mut Manifest) -> Result<usize> {
        let mut chunks = chunk_file(record, &self.config.chunker);
        if let Some(summary) = self
            .summaries
            .as_ref()
            .and_then(|s| s.cached_description(&record.path, &record.fingerprint))
        {
            for chunk in &mut chunks {
                chunk.parent_summary = Some(summary.clone());
            }
        }

        let texts: Vec<String> = chunks.iter().map(contextualize_for_embedding).collect();
        let what = format!("embedding {}", record.path);
        let vectors = retry_with_backoff(
            &what,
            self.config.max_retries,
            self.config.retry_backoff,
            || self.embedder.embed(&texts),
        )
        .await?;

        manifest.forget(&record.path)?;
        self.collection.remove_file(&record.path).await?;
        let entries = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| self.collection.entry(chunk, vector))
            .collect();
        self.collection.upsert(entries).await?;
        manifest.record(&record.path, &record.fingerprint, chunks.len())?;
        Ok(chunks.len())
    }

    /// Bring a single file's entries up to date (used by the watcher).
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the lock cannot be taken, `Load` if the
    /// file cannot be read, or any embedding, store, or manifest failure.
    pub async fn reindex_file(&self, abs_path: &Path) -> Result<ReindexOutcome> {
        let Some(rel) = self
            .source
            .relative_path(abs_path)
            .filter(|rel| self.source.accepts(rel))
        else {
            return Ok(ReindexOutcome::Skipped);
        };
        let _pass = self.pass.lock().await;
        let _lock = StoreLock::acquire(self.lock_path(), self.config.lock_timeout).await?;
        self.collection.refresh().await?;
        let mut manifest = Manifest::load(&self.chat_dir, self.collection.source_name())?;

        let record = if abs_path.exists() {
            self.source.load(abs_path)?
        } else {
            None
        };

        match record {
            Some(record) if manifest.is_unchanged(&record.path, &record.fingerprint) => {
                Ok(ReindexOutcome::Unchanged)
            }
            Some(record) => {
                let chunks = self.index_record(&record, &mut manifest).await?;
                tracing::info!(file = %record.path, chunks, "re-indexed");
                Ok(ReindexOutcome::Indexed { chunks })
            }
            None if manifest.files.contains_key(&rel) => {
                let chunks = self.remove_entries(&rel, &mut manifest).await?;
                tracing::info!(file = %rel, chunks, "removed entries");
                Ok(ReindexOutcome::Removed)
            }
            None => Ok(ReindexOutcome::Skipped),
        }
    }
}

#[cfg(test)]
mod tests {
    use askcode_llm::mock::MockProvider;

    use super::*;
    use crate::embedder::EmbedderConfig;
    use crate::loader::LoaderConfig;
    use crate::local::LocalVectorStore;
    use crate::project::SourceName;
    use crate::vector_store::VectorStore;

    struct Fixture {
        dir: tempfile::TempDir,
        provider: MockProvider,
        indexer: CodeIndexer<MockProvider>,
    }

    async fn fixture_with(provider: MockProvider, config: IndexerConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let chat_dir = dir.path().join(".chat");
        let store: Arc<dyn VectorStore> = Arc::new(LocalVectorStore::new());
        let embedder = Embedder::new(Arc::new(provider.clone()), EmbedderConfig::default());
        let collection = CodeCollection::reuse_or_create(
            store,
            SourceName::from("test"),
            "askcode_test",
            &embedder,
        )
        .await
        .unwrap();
        provider.reset_counters();
        let source = FileSource::new(dir.path(), &LoaderConfig::default()).unwrap();
        let indexer = CodeIndexer::new(source, chat_dir, Arc::new(collection), embedder, config);
        Fixture {
            dir,
            provider,
            indexer,
        }
    }

    async fn fixture() -> Fixture {
        let config = IndexerConfig {
            retry_backoff: Duration::from_millis(1),
            ..IndexerConfig::default()
        };
        fixture_with(MockProvider::default(), config).await
    }

    impl Fixture {
        fn write(&self, rel: &str, content: &str) {
            let path = self.dir.path().join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, content).unwrap();
        }

        fn manifest(&self) -> Manifest {
            Manifest::load(&self.dir.path().join(".chat"), &SourceName::from("test")).unwrap()
        }
    }

    #[test]
    fn default_config() {
        let config = IndexerConfig::default();
        assert_eq!(config.chunker.target_size, 600);
        assert_eq!(config.max_retries, 3);
        assert!(config.time_budget.is_none());
    }

    #[test]
    fn report_display_mentions_budget() {
        let report = IndexReport {
            files_scanned: 3,
            budget_exhausted: true,
            ..IndexReport::default()
        };
        let text = report.to_string();
        assert!(text.starts_with("scanned 3 files"));
        assert!(text.contains("time budget exhausted"));
    }

    #[tokio::test]
    async fn first_pass_indexes_and_marks_ready() {
        let fx = fixture().await;
        fx.write("a.py", "def alpha():\n    return 1\n");
        fx.write("src/b.rs", "fn beta() -> u8 { 2 }\n");

        let report = fx.indexer.index_project().await.unwrap();
        assert_eq!(report.files_scanned, 2);
        assert_eq!(report.files_indexed, 2);
        assert_eq!(report.chunks_created, 2);
        assert!(report.errors.is_empty());

        let manifest = fx.manifest();
        assert_eq!(manifest.status, IndexStatus::Ready);
        assert_eq!(manifest.files.len(), 2);
        assert_eq!(fx.indexer.collection().count().await.unwrap(), 2);
        assert!(
            StoreLock::try_acquire(&fx.dir.path().join(".chat").join(LOCK_FILE))
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn unchanged_files_are_not_embedded_again() {
        let fx = fixture().await;
        fx.write("a.py", "def alpha():\n    return 1\n");
        fx.indexer.index_project().await.unwrap();
        fx.provider.reset_counters();

        let report = fx.indexer.index_project().await.unwrap();
        assert_eq!(report.files_unchanged, 1);
        assert_eq!(report.files_indexed, 0);
        assert_eq!(fx.provider.embed_calls(), 0);
    }

    #[tokio::test]
    async fn changed_file_replaces_its_entries() {
        let fx = fixture().await;
        fx.write("a.py", "def alpha():\n    return 1\n");
        fx.indexer.index_project().await.unwrap();

        fx.write("a.py", "def alpha():\n    return 2\n");
        let report = fx.indexer.index_project().await.unwrap();
        assert_eq!(report.files_indexed, 1);
        assert_eq!(fx.indexer.collection().count().await.unwrap(), 1);
        let texts = fx.provider.embedded_texts();
        assert!(texts.last().unwrap().contains("return 2"));
    }

    #[tokio::test]
    async fn deleted_files_are_removed() {
        let fx = fixture().await;
        fx.write("a.py", "def alpha():\n    return 1\n");
        fx.write("b.py", "def beta():\n    return 2\n");
        fx.indexer.index_project().await.unwrap();

        std::fs::remove_file(fx.dir.path().join("b.py")).unwrap();
        let report = fx.indexer.index_project().await.unwrap();
        assert_eq!(report.files_removed, 1);
        assert_eq!(report.chunks_removed, 1);
        assert!(!fx.manifest().files.contains_key("b.py"));
        assert_eq!(fx.indexer.collection().count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn transient_embedding_failures_are_retried() {
        let config = IndexerConfig {
            retry_backoff: Duration::from_millis(1),
            ..IndexerConfig::default()
        };
        let fx = fixture_with(MockProvider::default(), config).await;
        let _ = fx.provider.clone().with_transient_embed_failures(2);
        fx.write("a.py", "def alpha():\n    return 1\n");

        let report = fx.indexer.index_project().await.unwrap();
        assert_eq!(report.files_indexed, 1);
        assert_eq!(fx.provider.embed_calls(), 3);
    }

    #[tokio::test]
    async fn persistent_embedding_failure_skips_file() {
        let config = IndexerConfig {
            max_retries: 1,
            retry_backoff: Duration::from_millis(1),
            ..IndexerConfig::default()
        };
        let provider = MockProvider::default().failing_embeddings_containing("poison");
        let fx = fixture_with(provider, config).await;
        fx.write("bad.py", "poison = True\n");
        fx.write("good.py", "fine = True\n");

        let report = fx.indexer.index_project().await.unwrap();
        assert_eq!(report.files_failed, 1);
        assert_eq!(report.files_indexed, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("bad.py"));

        let manifest = fx.manifest();
        assert_eq!(manifest.status, IndexStatus::Ready);
        assert!(!manifest.files.contains_key("bad.py"));
        assert!(manifest.files.contains_key("good.py"));
    }

    #[tokio::test]
    async fn zero_budget_stops_before_any_file() {
        let config = IndexerConfig {
            time_budget: Some(Duration::ZERO),
            ..IndexerConfig::default()
        };
        let fx = fixture_with(MockProvider::default(), config).await;
        fx.write("a.py", "a = 1\n");

        let report = fx.indexer.index_project().await.unwrap();
        assert!(report.budget_exhausted);
        assert_eq!(report.files_scanned, 0);
        assert_eq!(fx.manifest().status, IndexStatus::Indexing);
        assert!(
            StoreLock::try_acquire(&fx.dir.path().join(".chat").join(LOCK_FILE))
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn cached_summary_is_embedded_with_chunks() {
        let fx = fixture().await;
        fx.write("a.py", "def alpha():\n    return 1\n");
        let summaries = Arc::new(
            SummaryCache::open(
                &fx.dir.path().join(".chat"),
                FileSource::new(fx.dir.path(), &LoaderConfig::default()).unwrap(),
                Arc::new(MockProvider::with_responses(vec!["Alpha helpers.".into()])),
                crate::summary::SummaryConfig::default(),
            )
            .unwrap(),
        );
        summaries.get_description(Path::new("a.py")).await.unwrap();

        let Fixture {
            dir,
            provider,
            indexer,
        } = fx;
        let indexer = indexer.with_summaries(summaries);
        indexer.index_project().await.unwrap();
        assert!(provider.embedded_texts()[0].contains("# Summary: Alpha helpers.\n"));
        drop(dir);
    }

    #[tokio::test]
    async fn reindex_file_tracks_single_changes() {
        let fx = fixture().await;
        fx.write("a.py", "def alpha():\n    return 1\n");
        let abs = fx.dir.path().join("a.py");

        assert_eq!(
            fx.indexer.reindex_file(&abs).await.unwrap(),
            ReindexOutcome::Indexed { chunks: 1 }
        );
        assert_eq!(
            fx.indexer.reindex_file(&abs).await.unwrap(),
            ReindexOutcome::Unchanged
        );

        std::fs::remove_file(&abs).unwrap();
        assert_eq!(
            fx.indexer.reindex_file(&abs).await.unwrap(),
            ReindexOutcome::Removed
        );
        assert_eq!(fx.indexer.collection().count().await.unwrap(), 0);
        assert_eq!(
            fx.indexer.reindex_file(&abs).await.unwrap(),
            ReindexOutcome::Skipped
        );
    }

    #[tokio::test]
    async fn reindex_file_skips_what_the_walk_skips() {
        let fx = fixture().await;
        fx.write(".gitignore", "target/\n");
        fx.write("target/gen.rs", "fn generated() {}\n");
        fx.write(".env", "API_KEY=secret\n");
        fx.write("main.rs", "fn main() {}\n");

        let report = fx.indexer.index_project().await.unwrap();
        assert_eq!(report.files_indexed, 1);

        for rel in ["target/gen.rs", ".env"] {
            assert_eq!(
                fx.indexer.reindex_file(&fx.dir.path().join(rel)).await.unwrap(),
                ReindexOutcome::Skipped
            );
        }
        assert_eq!(fx.provider.embedded_texts().len(), 1);

        let again = fx.indexer.index_project().await.unwrap();
        assert_eq!(again.files_removed, 0);
        assert_eq!(again.files_unchanged, 1);
    }

    #[tokio::test]
    async fn chat_dir_is_never_indexed() {
        let fx = fixture().await;
        fx.write("a.py", "a = 1\n");
        fx.indexer.index_project().await.unwrap();
        let report = fx.indexer.index_project().await.unwrap();
        assert_eq!(report.files_scanned, 1);
        assert!(fx.manifest().files.keys().all(|p| !p.starts_with(".chat")));
    }
}
