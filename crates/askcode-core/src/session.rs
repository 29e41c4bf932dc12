//! Per-invocation context: one project, one provider, one store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use askcode_index::collection::{CodeCollection, default_collection_name};
use askcode_index::embedder::Embedder;
use askcode_index::indexer::{CodeIndexer, IndexReport, LOCK_FILE};
use askcode_index::loader::{CHAT_DIR, FileSource};
use askcode_index::lock::StoreLock;
use askcode_index::manifest::Manifest;
use askcode_index::project::{ProjectMarker, SourceName};
use askcode_index::retriever::{Answer, QaChain};
use askcode_index::summary::SummaryCache;
use askcode_index::vector_store::VectorStore;
use askcode_index::watcher::IndexWatcher;
use askcode_llm::any::AnyProvider;
use askcode_llm::provider::LlmProvider;

use crate::bootstrap::{create_provider, create_store};
use crate::config::{Config, StoreBackend};

/// Everything one CLI invocation needs. Locks taken by its operations are
/// released when those operations return.
pub struct Session<P: LlmProvider> {
    root: PathBuf,
    chat_dir: PathBuf,
    source_name: SourceName,
    config: Config,
    provider: Arc<P>,
    store: Arc<dyn VectorStore>,
}

impl Session<AnyProvider> {
    /// Open the project rooted at `root` with providers built from `config`.
    ///
    /// With the local backend this first waits for a concurrent indexer to
    /// finish, so the snapshot it loads is complete.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the project marker
    /// is unreadable, or the provider or store cannot be created.
    pub async fn open(root: &Path, config: Config) -> anyhow::Result<Self> {
        config.validate()?;
        let root = canonical_root(root)?;
        let chat_dir = root.join(CHAT_DIR);
        if config.store.backend == StoreBackend::Local {
            StoreLock::wait_released(&chat_dir.join(LOCK_FILE), config.lock_timeout()).await?;
        }
        let provider = Arc::new(create_provider(&config)?);
        let store = create_store(&config, &chat_dir)?;
        Self::assemble(root, config, provider, store)
    }
}

impl<P: LlmProvider> Session<P> {
    /// Session over explicitly supplied collaborators.
    ///
    /// # Errors
    ///
    /// Returns an error if `root` is not a directory or the project marker is
    /// unreadable.
    pub fn with_parts(
        root: &Path,
        config: Config,
        provider: Arc<P>,
        store: Arc<dyn VectorStore>,
    ) -> anyhow::Result<Self> {
        Self::assemble(canonical_root(root)?, config, provider, store)
    }

    fn assemble(
        root: PathBuf,
        config: Config,
        provider: Arc<P>,
        store: Arc<dyn VectorStore>,
    ) -> anyhow::Result<Self> {
        let chat_dir = root.join(CHAT_DIR);
        let source_name = ProjectMarker::load_or_create(&chat_dir)
            .with_context(|| format!("failed to load project marker in {}", chat_dir.display()))?;
        tracing::debug!(root = %root.display(), source_name = %source_name, "session opened");
        Ok(Self {
            root,
            chat_dir,
            source_name,
            config,
            provider,
            store,
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn chat_dir(&self) -> &Path {
        &self.chat_dir
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn source_name(&self) -> &SourceName {
        &self.source_name
    }

    /// The configured shared collection, or this project's own.
    #[must_use]
    pub fn collection_name(&self) -> String {
        self.config
            .store
            .collection
            .clone()
            .unwrap_or_else(|| default_collection_name(&self.source_name))
    }

    fn embedder(&self) -> Embedder<P> {
        Embedder::new(Arc::clone(&self.provider), self.config.embedder_config())
    }

    fn file_source(&self) -> anyhow::Result<FileSource> {
        Ok(FileSource::new(&self.root, &self.config.loader_config())?)
    }

    /// # Errors
    ///
    /// Returns an error if the include/exclude globs are invalid or the cache
    /// file cannot be read.
    pub fn summaries(&self) -> anyhow::Result<SummaryCache<P>> {
        Ok(SummaryCache::open(
            &self.chat_dir,
            self.file_source()?,
            Arc::clone(&self.provider),
            self.config.summary_config(),
        )?)
    }

    /// # Errors
    ///
    /// Returns `StoreUnavailable` if the collection cannot be created, or an
    /// embedding error if the dimension probe fails.
    pub async fn indexer(&self) -> anyhow::Result<CodeIndexer<P>> {
        let embedder = self.embedder();
        let collection = CodeCollection::reuse_or_create(
            Arc::clone(&self.store),
            self.source_name.clone(),
            &self.collection_name(),
            &embedder,
        )
        .await?;
        let indexer = CodeIndexer::new(
            self.file_source()?,
            &self.chat_dir,
            Arc::new(collection),
            embedder,
            self.config.indexer_config(),
        );
        Ok(if self.config.index.embed_summaries {
            indexer.with_summaries(Arc::new(self.summaries()?))
        } else {
            indexer
        })
    }

    /// Incremental indexing pass over the project.
    ///
    /// # Errors
    ///
    /// Returns any error that aborts the pass.
    pub async fn index(&self) -> anyhow::Result<IndexReport> {
        let report = self.indexer().await?.index_project().await?;
        Ok(report)
    }

    #[must_use]
    pub fn qa_chain(&self) -> QaChain<P> {
        QaChain::new(
            Arc::clone(&self.store),
            self.source_name.clone(),
            self.collection_name(),
            self.embedder(),
            Arc::clone(&self.provider),
            self.config.retrieval_config(),
        )
    }

    /// Answer `question`, indexing changes first when `index.auto_index` is set.
    ///
    /// # Errors
    ///
    /// Returns `NoIndex` (inside the `anyhow` chain) if nothing is indexed, or
    /// any indexing, retrieval, or generation failure.
    pub async fn ask(&self, question: &str) -> anyhow::Result<Answer> {
        if self.config.index.auto_index {
            let report = self.index().await?;
            tracing::info!("{report}");
        }
        Ok(self.qa_chain().ask(question).await?)
    }

    /// Description of a file or directory, from the cache when still valid.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is outside the project, unreadable, or
    /// generation fails.
    pub async fn describe(&self, path: &Path) -> anyhow::Result<String> {
        let cache = self.summaries()?;
        cache
            .get_description(path)
            .await
            .with_context(|| format!("failed to describe {}", path.display()))
    }

    /// Remove this project's entries and manifest. A private collection is
    /// dropped entirely; in a shared collection only this project's entries
    /// are deleted. Returns the number of entries removed.
    ///
    /// # Errors
    ///
    /// Returns `StoreUnavailable` if an indexer holds the lock, or any store
    /// or manifest failure.
    pub async fn reset(&self) -> anyhow::Result<u64> {
        let _lock =
            StoreLock::acquire(self.chat_dir.join(LOCK_FILE), self.config.lock_timeout()).await?;
        self.store.refresh(&self.collection_name()).await?;
        let mut removed = 0;
        if let Some(collection) = CodeCollection::open_existing(
            Arc::clone(&self.store),
            self.source_name.clone(),
            &self.collection_name(),
        )
        .await?
        {
            removed = collection.count().await?;
            if self.config.store.collection.is_some() {
                collection.clear().await?;
            } else {
                collection.drop_collection().await?;
            }
        }
        Manifest::load(&self.chat_dir, &self.source_name)?.clear()?;
        tracing::info!(removed, collection = %self.collection_name(), "index reset");
        Ok(removed)
    }
}

impl<P: LlmProvider + 'static> Session<P> {
    /// Run one indexing pass, then keep the index current until the returned
    /// watcher is dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial pass aborts or the watcher cannot start.
    pub async fn watch(&self) -> anyhow::Result<(IndexReport, IndexWatcher)> {
        let indexer = Arc::new(self.indexer().await?);
        let report = indexer.index_project().await?;
        let watcher = IndexWatcher::start(&self.root, indexer)?;
        Ok((report, watcher))
    }
}

fn canonical_root(root: &Path) -> anyhow::Result<PathBuf> {
    let root = root
        .canonicalize()
        .with_context(|| format!("project directory {} not found", root.display()))?;
    anyhow::ensure!(root.is_dir(), "{} is not a directory", root.display());
    Ok(root)
}
