//! Error types for askcode-index.

use askcode_llm::LlmError;

use crate::vector_store::VectorStoreError;

/// A single file could not be loaded. Never fatal: the walk logs and skips it.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("walk error: {0}")]
    Walk(#[from] ignore::Error),
}

/// Errors raised by indexing, storage, and retrieval.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error(transparent)]
    Load(#[from] LoadError),

    /// The embedding backend failed after all retries.
    #[error("embedding backend error: {0}")]
    EmbeddingBackend(#[from] LlmError),

    /// The collection cannot be opened or locked.
    #[error("vector store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("vector store error: {0}")]
    Store(#[from] VectorStoreError),

    #[error("nothing indexed yet, run `askcode index` first")]
    NoIndex,

    /// Answer generation failed or timed out. Not retried.
    #[error("answer generation failed: {0}")]
    Generation(#[source] LlmError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid glob pattern: {0}")]
    Glob(#[from] globset::Error),

    #[error("parse failed: {0}")]
    Parse(String),

    #[error("watcher error: {0}")]
    Watcher(#[from] notify::Error),

    #[error("{0}")]
    Other(String),
}

impl IndexError {
    /// Store-level failures abort an indexing pass; everything else is per-file.
    #[must_use]
    pub fn is_store_failure(&self) -> bool {
        matches!(self, Self::Store(_) | Self::StoreUnavailable(_))
    }
}

/// Result type alias using `IndexError`.
pub type Result<T> = std::result::Result<T, IndexError>;
