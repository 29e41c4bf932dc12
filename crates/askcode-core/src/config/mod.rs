mod env;
mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, bail};
use askcode_index::chunker::ChunkerConfig;
use askcode_index::embedder::EmbedderConfig;
use askcode_index::indexer::IndexerConfig;
use askcode_index::loader::LoaderConfig;
use askcode_index::summary::SummaryConfig;

impl Config {
    /// Load configuration from a TOML file with env var overrides.
    ///
    /// Falls back to defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            toml::from_str::<Self>(&content)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Reject settings no component can work with.
    ///
    /// # Errors
    ///
    /// Returns the first problem found.
    pub fn validate(&self) -> anyhow::Result<()> {
        let index = &self.index;
        if index.batch_size == 0 {
            bail!("index.batch_size must be at least 1");
        }
        if index.concurrency == 0 {
            bail!("index.concurrency must be at least 1");
        }
        if index.window_size == 0 || index.window_overlap >= index.window_size {
            bail!(
                "index.window_overlap ({}) must be smaller than index.window_size ({})",
                index.window_overlap,
                index.window_size
            );
        }
        if index.min_chunk_size > index.target_chunk_size
            || index.target_chunk_size > index.max_chunk_size
        {
            bail!("index chunk sizes must satisfy min_chunk_size <= target_chunk_size <= max_chunk_size");
        }
        if self.retrieval.top_k == 0 {
            bail!("retrieval.top_k must be at least 1");
        }
        if !(-1.0..=1.0).contains(&self.retrieval.score_threshold) {
            bail!("retrieval.score_threshold must be within [-1, 1]");
        }

        url::Url::parse(&self.llm.base_url)
            .with_context(|| format!("llm.base_url is not a valid URL: {}", self.llm.base_url))?;
        if let Some(openai) = &self.llm.openai {
            url::Url::parse(&openai.base_url).with_context(|| {
                format!("llm.openai.base_url is not a valid URL: {}", openai.base_url)
            })?;
        }
        if self.store.backend == StoreBackend::Qdrant {
            url::Url::parse(&self.store.qdrant_url).with_context(|| {
                format!("store.qdrant_url is not a valid URL: {}", self.store.qdrant_url)
            })?;
        }
        if let Some(name) = &self.store.collection
            && !name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            bail!("store.collection may only contain ASCII letters, digits, '_' and '-'");
        }
        Ok(())
    }

    #[must_use]
    pub fn loader_config(&self) -> LoaderConfig {
        LoaderConfig {
            include: self.index.include.clone(),
            exclude: self.index.exclude.clone(),
            max_file_size: self.index.max_file_size,
        }
    }

    #[must_use]
    pub fn embedder_config(&self) -> EmbedderConfig {
        EmbedderConfig {
            batch_size: self.index.batch_size,
            concurrency: self.index.concurrency,
            timeout: Duration::from_secs(self.timeouts.embedding_seconds),
        }
    }

    #[must_use]
    pub fn indexer_config(&self) -> IndexerConfig {
        IndexerConfig {
            chunker: ChunkerConfig {
                target_size: self.index.target_chunk_size,
                max_size: self.index.max_chunk_size,
                min_size: self.index.min_chunk_size,
                window_size: self.index.window_size,
                window_overlap: self.index.window_overlap,
            },
            max_retries: self.index.max_retries,
            retry_backoff: Duration::from_millis(self.index.retry_backoff_ms),
            time_budget: self.index.time_budget_seconds.map(Duration::from_secs),
            lock_timeout: self.lock_timeout(),
        }
    }

    #[must_use]
    pub fn retrieval_config(&self) -> askcode_index::retriever::RetrievalConfig {
        askcode_index::retriever::RetrievalConfig {
            top_k: self.retrieval.top_k,
            score_threshold: self.retrieval.score_threshold,
            max_context_tokens: self.retrieval.max_context_tokens,
            llm_timeout: Duration::from_secs(self.timeouts.llm_seconds),
        }
    }

    #[must_use]
    pub fn summary_config(&self) -> SummaryConfig {
        SummaryConfig {
            max_file_chars: self.index.summary_max_file_chars,
            timeout: Duration::from_secs(self.timeouts.llm_seconds),
        }
    }

    #[must_use]
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.store.lock_timeout_seconds)
    }
}
