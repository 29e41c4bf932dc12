//! Builds the provider and vector store a [`crate::Session`] runs on.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use askcode_index::loader::CHAT_DIR;
use askcode_index::local::LocalVectorStore;
use askcode_index::qdrant::QdrantStore;
use askcode_index::vector_store::VectorStore;
use askcode_llm::any::AnyProvider;
use askcode_llm::ollama::OllamaProvider;
use askcode_llm::openai::OpenAiProvider;

use crate::config::{Config, ProviderKind, StoreBackend};

pub const CONFIG_FILE: &str = "config.toml";
pub const VECTORS_DIR: &str = "vectors";

/// Priority: explicit path (`--config` or `ASKCODE_CONFIG`) > `<project>/.chat/config.toml`.
#[must_use]
pub fn resolve_config_path(project_root: &Path, explicit: Option<&Path>) -> PathBuf {
    explicit.map_or_else(
        || project_root.join(CHAT_DIR).join(CONFIG_FILE),
        Path::to_path_buf,
    )
}

/// # Errors
///
/// Returns an error if the OpenAI backend is selected without its config
/// section or API key.
pub fn create_provider(config: &Config) -> anyhow::Result<AnyProvider> {
    match config.llm.provider {
        ProviderKind::Ollama => Ok(AnyProvider::Ollama(OllamaProvider::new(
            &config.llm.base_url,
            config.llm.model.clone(),
            config.llm.embedding_model.clone(),
        ))),
        ProviderKind::OpenAi => {
            let openai_cfg = config
                .llm
                .openai
                .as_ref()
                .context("llm.openai config section required for OpenAI provider")?;
            let api_key = config
                .secrets
                .openai_api_key
                .as_ref()
                .context("ASKCODE_OPENAI_API_KEY is not set")?
                .expose()
                .to_owned();
            let provider = OpenAiProvider::new(
                api_key,
                openai_cfg.base_url.clone(),
                openai_cfg.model.clone(),
                openai_cfg.max_tokens,
                openai_cfg.embedding_model.clone(),
            )
            .with_timeout(Duration::from_secs(config.timeouts.llm_seconds));
            Ok(AnyProvider::OpenAi(provider))
        }
    }
}

/// # Errors
///
/// Returns an error if the local snapshot directory cannot be loaded or the
/// Qdrant client cannot be created.
pub fn create_store(config: &Config, chat_dir: &Path) -> anyhow::Result<Arc<dyn VectorStore>> {
    match config.store.backend {
        StoreBackend::Local => {
            let dir = chat_dir.join(VECTORS_DIR);
            let store = LocalVectorStore::open(&dir)
                .with_context(|| format!("failed to open local vector store at {}", dir.display()))?;
            Ok(Arc::new(store))
        }
        StoreBackend::Qdrant => {
            let store = QdrantStore::new(&config.store.qdrant_url).with_context(|| {
                format!("failed to connect to Qdrant at {}", config.store.qdrant_url)
            })?;
            Ok(Arc::new(store))
        }
    }
}
