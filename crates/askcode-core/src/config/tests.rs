use std::io::Write;

use serial_test::serial;

use super::*;

const ENV_KEYS: [&str; 22] = [
    "ASKCODE_LLM_PROVIDER",
    "ASKCODE_LLM_BASE_URL",
    "ASKCODE_LLM_MODEL",
    "ASKCODE_LLM_EMBEDDING_MODEL",
    "ASKCODE_OPENAI_API_KEY",
    "ASKCODE_TIMEOUT_LLM",
    "ASKCODE_TIMEOUT_EMBEDDING",
    "ASKCODE_INDEX_INCLUDE",
    "ASKCODE_INDEX_EXCLUDE",
    "ASKCODE_INDEX_MAX_FILE_SIZE",
    "ASKCODE_INDEX_BATCH_SIZE",
    "ASKCODE_INDEX_CONCURRENCY",
    "ASKCODE_INDEX_TIME_BUDGET",
    "ASKCODE_INDEX_AUTO",
    "ASKCODE_INDEX_EMBED_SUMMARIES",
    "ASKCODE_RETRIEVAL_TOP_K",
    "ASKCODE_RETRIEVAL_SCORE_THRESHOLD",
    "ASKCODE_RETRIEVAL_MAX_CONTEXT_TOKENS",
    "ASKCODE_STORE_BACKEND",
    "ASKCODE_QDRANT_URL",
    "ASKCODE_COLLECTION",
    "ASKCODE_STORE_LOCK_TIMEOUT",
];

fn clear_env() {
    for key in ENV_KEYS {
        unsafe { std::env::remove_var(key) };
    }
}

#[test]
fn defaults_when_file_missing() {
    let config = Config::default();
    assert_eq!(config.llm.provider, ProviderKind::Ollama);
    assert_eq!(config.llm.base_url, "http://localhost:11434");
    assert_eq!(config.store.backend, StoreBackend::Local);
    assert_eq!(config.store.qdrant_url, "http://localhost:6334");
    assert!(config.store.collection.is_none());
    assert_eq!(config.retrieval.top_k, 6);
    assert!(config.index.auto_index);
    assert!(!config.index.embed_summaries);
    assert!(config.index.time_budget_seconds.is_none());
    assert!(config.secrets.openai_api_key.is_none());
    config.validate().unwrap();
}

#[test]
#[serial]
fn load_missing_file_uses_defaults() {
    clear_env();
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.index.batch_size, 32);
}

#[test]
#[serial]
fn parse_valid_toml() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    let mut f = std::fs::File::create(&path).unwrap();
    write!(
        f,
        r#"
[llm]
provider = "openai"
model = "unused-for-openai"

[llm.openai]
model = "gpt-4o-mini"
embedding_model = "text-embedding-3-small"

[index]
exclude = ["vendor/**"]
window_size = 1000
window_overlap = 100
time_budget_seconds = 90

[retrieval]
top_k = 3

[store]
backend = "qdrant"
collection = "team_code"
"#
    )
    .unwrap();

    clear_env();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.llm.provider, ProviderKind::OpenAi);
    let openai = config.llm.openai.as_ref().unwrap();
    assert_eq!(openai.base_url, "https://api.openai.com/v1");
    assert_eq!(openai.max_tokens, 1024);
    assert_eq!(config.index.exclude, ["vendor/**"]);
    assert_eq!(config.index.window_size, 1000);
    assert_eq!(config.index.batch_size, 32);
    assert_eq!(config.indexer_config().time_budget, Some(std::time::Duration::from_secs(90)));
    assert_eq!(config.retrieval.top_k, 3);
    assert_eq!(config.store.backend, StoreBackend::Qdrant);
    assert_eq!(config.store.collection.as_deref(), Some("team_code"));
    config.validate().unwrap();
}

#[test]
#[serial]
fn malformed_toml_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[index\nbatch_size = ").unwrap();
    clear_env();
    let err = Config::load(&path).unwrap_err();
    assert!(format!("{err:#}").contains("failed to parse config file"));
}

#[test]
#[serial]
fn env_overrides() {
    clear_env();
    let mut config = Config::default();

    unsafe {
        std::env::set_var("ASKCODE_LLM_MODEL", "llama3.1:8b");
        std::env::set_var("ASKCODE_STORE_BACKEND", "Qdrant");
        std::env::set_var("ASKCODE_INDEX_EXCLUDE", "target/**, ,docs/**");
        std::env::set_var("ASKCODE_RETRIEVAL_TOP_K", "10");
        std::env::set_var("ASKCODE_INDEX_AUTO", "false");
        std::env::set_var("ASKCODE_OPENAI_API_KEY", "sk-test");
    }
    config.apply_env_overrides();
    clear_env();

    assert_eq!(config.llm.model, "llama3.1:8b");
    assert_eq!(config.store.backend, StoreBackend::Qdrant);
    assert_eq!(config.index.exclude, ["target/**", "docs/**"]);
    assert_eq!(config.retrieval.top_k, 10);
    assert!(!config.index.auto_index);
    assert_eq!(
        config.secrets.openai_api_key.as_ref().map(crate::secret::Secret::expose),
        Some("sk-test")
    );
}

#[test]
#[serial]
fn invalid_env_values_are_ignored() {
    clear_env();
    let mut config = Config::default();

    unsafe {
        std::env::set_var("ASKCODE_LLM_PROVIDER", "claude");
        std::env::set_var("ASKCODE_RETRIEVAL_TOP_K", "many");
        std::env::set_var("ASKCODE_INDEX_AUTO", "sometimes");
    }
    config.apply_env_overrides();
    clear_env();

    assert_eq!(config.llm.provider, ProviderKind::Ollama);
    assert_eq!(config.retrieval.top_k, 6);
    assert!(config.index.auto_index);
}

#[test]
#[serial]
fn empty_collection_env_unsets_shared_collection() {
    clear_env();
    let mut config = Config::default();
    config.store.collection = Some("shared".into());
    unsafe { std::env::set_var("ASKCODE_COLLECTION", "") };
    config.apply_env_overrides();
    clear_env();
    assert!(config.store.collection.is_none());
}

#[test]
fn validate_rejects_overlap_not_smaller_than_window() {
    let mut config = Config::default();
    config.index.window_overlap = config.index.window_size;
    assert!(config.validate().is_err());
}

#[test]
fn validate_rejects_zero_batch_and_top_k() {
    let mut config = Config::default();
    config.index.batch_size = 0;
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.retrieval.top_k = 0;
    assert!(config.validate().is_err());
}

#[test]
fn validate_rejects_malformed_urls() {
    let mut config = Config::default();
    config.llm.base_url = "not a url".into();
    assert!(config.validate().is_err());

    let mut config = Config::default();
    config.store.backend = StoreBackend::Qdrant;
    config.store.qdrant_url = "qdrant host:6334".into();
    assert!(config.validate().is_err());
}

#[test]
fn validate_rejects_bad_collection_name() {
    let mut config = Config::default();
    config.store.collection = Some("../escape".into());
    assert!(config.validate().is_err());
}

#[test]
fn debug_output_redacts_api_key() {
    let mut config = Config::default();
    config.secrets.openai_api_key = Some(crate::secret::Secret::new("sk-very-secret"));
    let debug = format!("{config:?}");
    assert!(!debug.contains("sk-very-secret"));
    assert!(debug.contains("[REDACTED]"));
}

#[test]
fn derived_component_configs() {
    let config = Config::default();
    assert_eq!(config.indexer_config().chunker.window_overlap, 200);
    assert_eq!(config.embedder_config().batch_size, 32);
    assert_eq!(
        config.retrieval_config().llm_timeout,
        std::time::Duration::from_secs(120)
    );
    assert_eq!(config.summary_config().max_file_chars, 6000);
    assert!(config.loader_config().include.is_empty());
}
