use std::str::FromStr;

use super::{Config, ProviderKind, StoreBackend};
use crate::secret::Secret;

/// Parse `key` from the environment, warning about values that do not parse.
fn parsed<T: FromStr>(key: &str) -> Option<T> {
    let v = std::env::var(key).ok()?;
    match v.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            tracing::warn!("ignoring invalid {key} value: {v}");
            None
        }
    }
}

fn lowercase_enum<T: serde::de::DeserializeOwned>(key: &str) -> Option<T> {
    let v = std::env::var(key).ok()?;
    if let Ok(kind) = serde_json::from_value(serde_json::Value::String(v.to_lowercase())) {
        Some(kind)
    } else {
        tracing::warn!("ignoring invalid {key} value: {v}");
        None
    }
}

fn list(key: &str) -> Option<Vec<String>> {
    let v = std::env::var(key).ok()?;
    Some(
        v.split(',')
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .collect(),
    )
}

impl Config {
    pub(crate) fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_llm();
        self.apply_env_overrides_index();
        self.apply_env_overrides_store();
    }

    fn apply_env_overrides_llm(&mut self) {
        if let Some(kind) = lowercase_enum::<ProviderKind>("ASKCODE_LLM_PROVIDER") {
            self.llm.provider = kind;
        }
        if let Ok(v) = std::env::var("ASKCODE_LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Ok(v) = std::env::var("ASKCODE_LLM_MODEL") {
            self.llm.model = v;
        }
        if let Ok(v) = std::env::var("ASKCODE_LLM_EMBEDDING_MODEL") {
            self.llm.embedding_model = v;
        }
        if let Ok(v) = std::env::var("ASKCODE_OPENAI_API_KEY")
            && !v.is_empty()
        {
            self.secrets.openai_api_key = Some(Secret::new(v));
        }
        if let Some(secs) = parsed("ASKCODE_TIMEOUT_LLM") {
            self.timeouts.llm_seconds = secs;
        }
        if let Some(secs) = parsed("ASKCODE_TIMEOUT_EMBEDDING") {
            self.timeouts.embedding_seconds = secs;
        }
    }

    fn apply_env_overrides_index(&mut self) {
        if let Some(globs) = list("ASKCODE_INDEX_INCLUDE") {
            self.index.include = globs;
        }
        if let Some(globs) = list("ASKCODE_INDEX_EXCLUDE") {
            self.index.exclude = globs;
        }
        if let Some(bytes) = parsed("ASKCODE_INDEX_MAX_FILE_SIZE") {
            self.index.max_file_size = bytes;
        }
        if let Some(n) = parsed("ASKCODE_INDEX_BATCH_SIZE") {
            self.index.batch_size = n;
        }
        if let Some(n) = parsed("ASKCODE_INDEX_CONCURRENCY") {
            self.index.concurrency = n;
        }
        if let Some(secs) = parsed("ASKCODE_INDEX_TIME_BUDGET") {
            self.index.time_budget_seconds = Some(secs);
        }
        if let Some(enabled) = parsed("ASKCODE_INDEX_AUTO") {
            self.index.auto_index = enabled;
        }
        if let Some(enabled) = parsed("ASKCODE_INDEX_EMBED_SUMMARIES") {
            self.index.embed_summaries = enabled;
        }
        if let Some(k) = parsed("ASKCODE_RETRIEVAL_TOP_K") {
            self.retrieval.top_k = k;
        }
        if let Some(threshold) = parsed("ASKCODE_RETRIEVAL_SCORE_THRESHOLD") {
            self.retrieval.score_threshold = threshold;
        }
        if let Some(tokens) = parsed("ASKCODE_RETRIEVAL_MAX_CONTEXT_TOKENS") {
            self.retrieval.max_context_tokens = tokens;
        }
    }

    fn apply_env_overrides_store(&mut self) {
        if let Some(backend) = lowercase_enum::<StoreBackend>("ASKCODE_STORE_BACKEND") {
            self.store.backend = backend;
        }
        if let Ok(v) = std::env::var("ASKCODE_QDRANT_URL") {
            self.store.qdrant_url = v;
        }
        if let Ok(v) = std::env::var("ASKCODE_COLLECTION") {
            self.store.collection = (!v.trim().is_empty()).then_some(v);
        }
        if let Some(secs) = parsed("ASKCODE_STORE_LOCK_TIMEOUT") {
            self.store.lock_timeout_seconds = secs;
        }
    }
}
