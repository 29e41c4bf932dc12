//! Question answering over an indexed project: embed → search → pack → generate.

use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;

use askcode_llm::LlmError;
use askcode_llm::provider::{LlmProvider, Message};

use crate::collection::{CodeCollection, SearchHit};
use crate::embedder::Embedder;
use crate::error::{IndexError, Result};
use crate::project::SourceName;
use crate::vector_store::VectorStore;

/// Fixed per-chunk cost of the `<chunk ...>` wrapper, in tokens.
pub const CHUNK_OVERHEAD_TOKENS: usize = 20;

const SYSTEM_PROMPT: &str = "You answer questions about a software project. \
Use only the code excerpts inside <code_context>. Refer to code as path:start-end. \
If the excerpts do not contain the answer, say that you could not find it.";

#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub top_k: usize,
    /// Hits with a lower cosine similarity are dropped.
    pub score_threshold: f32,
    /// Token budget for the packed `<code_context>` block.
    pub max_context_tokens: usize,
    pub llm_timeout: Duration,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 6,
            score_threshold: 0.25,
            max_context_tokens: 3000,
            llm_timeout: Duration::from_secs(120),
        }
    }
}

/// Chunks selected for one question, in rank order.
#[derive(Debug, Clone, Default)]
pub struct Retrieval {
    /// Full chunk text, as stored.
    pub chunks: Vec<SearchHit>,
    pub total_tokens: usize,
    /// Set when the best chunk alone exceeded the budget: the number of its
    /// characters that go into the prompt.
    pub truncated_to: Option<usize>,
}

impl Retrieval {
    /// The `<code_context>` block for the prompt, with the budget cut applied.
    #[must_use]
    pub fn context(&self) -> String {
        let Some(max) = self.truncated_to else {
            return format_as_context(&self.chunks);
        };
        let mut chunks = self.chunks.clone();
        if let Some(first) = chunks.first_mut() {
            first.text = truncate_chars(&first.text, max).to_owned();
        }
        format_as_context(&chunks)
    }
}

#[derive(Debug, Clone)]
pub struct Answer {
    pub text: String,
    /// The chunks placed in the prompt, with their full stored text.
    pub sources: Vec<SearchHit>,
}

pub struct QaChain<P: LlmProvider> {
    store: Arc<dyn VectorStore>,
    source_name: SourceName,
    collection_name: String,
    embedder: Embedder<P>,
    generator: Arc<P>,
    config: RetrievalConfig,
}

impl<P: LlmProvider> QaChain<P> {
    #[must_use]
    pub fn new(
        store: Arc<dyn VectorStore>,
        source_name: SourceName,
        collection_name: impl Into<String>,
        embedder: Embedder<P>,
        generator: Arc<P>,
        config: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            source_name,
            collection_name: collection_name.into(),
            embedder,
            generator,
            config,
        }
    }

    async fn collection(&self) -> Result<CodeCollection> {
        self.store.refresh(&self.collection_name).await?;
        let collection = CodeCollection::open_existing(
            Arc::clone(&self.store),
            self.source_name.clone(),
            &self.collection_name,
        )
        .await?
        .ok_or(IndexError::NoIndex)?;
        if collection.count().await? == 0 {
            return Err(IndexError::NoIndex);
        }
        Ok(collection)
    }

    /// The chunks that would be sent to the generator for `question`.
    ///
    /// # Errors
    ///
    /// Returns `NoIndex` if nothing is indexed for this project,
    /// `EmbeddingBackend` if the question cannot be embedded, or `Store` if
    /// the search fails.
    pub async fn retrieve(&self, question: &str) -> Result<Retrieval> {
        let collection = self.collection().await?;
        let vector = self.embedder.embed_one(question).await?;
        let mut hits = collection.search(vector, self.config.top_k).await?;
        hits.retain(|h| h.score >= self.config.score_threshold);
        tracing::debug!(hits = hits.len(), "retrieved chunks");
        Ok(pack(hits, self.config.max_context_tokens))
    }

    /// Answer `question` from the project's indexed code.
    ///
    /// # Errors
    ///
    /// Everything [`QaChain::retrieve`] returns, plus `Generation` if the
    /// backend fails, times out, or answers with nothing. Not retried.
    pub async fn ask(&self, question: &str) -> Result<Answer> {
        let retrieval = self.retrieve(question).await?;
        let context = retrieval.context();
        let messages = [
            Message::system(SYSTEM_PROMPT),
            Message::user(format!("{context}\n\nQuestion: {question}")),
        ];

        let timeout = self.config.llm_timeout;
        let text = tokio::time::timeout(timeout, self.generator.chat(&messages))
            .await
            .map_err(|_| {
                IndexError::Generation(LlmError::Timeout {
                    provider: self.generator.name().to_owned(),
                    secs: timeout.as_secs(),
                })
            })?
            .map_err(IndexError::Generation)?;
        if text.trim().is_empty() {
            return Err(IndexError::Generation(LlmError::EmptyResponse {
                provider: self.generator.name().to_owned(),
            }));
        }

        tracing::info!(
            sources = retrieval.chunks.len(),
            context_tokens = retrieval.total_tokens,
            "answered question"
        );
        Ok(Answer {
            text: text.trim().to_owned(),
            sources: retrieval.chunks,
        })
    }
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Keep hits in rank order while they fit `budget` tokens. The lowest-ranked
/// hits go first; a best hit that alone exceeds the budget is cut down to fit
/// in the prompt but kept whole in `chunks`.
#[must_use]
pub fn pack(hits: Vec<SearchHit>, budget: usize) -> Retrieval {
    let mut packed = Vec::new();
    let mut used = 0;
    let mut truncated_to = None;
    for (rank, hit) in hits.into_iter().enumerate() {
        let cost = estimate_tokens(&hit.text) + CHUNK_OVERHEAD_TOKENS;
        if used + cost <= budget {
            used += cost;
            packed.push(hit);
            continue;
        }
        if rank == 0 {
            let room = budget.saturating_sub(CHUNK_OVERHEAD_TOKENS) * 4;
            let cut = truncate_chars(&hit.text, room);
            if !cut.trim().is_empty() {
                used += estimate_tokens(cut) + CHUNK_OVERHEAD_TOKENS;
                truncated_to = Some(cut.chars().count());
                packed.push(hit);
            }
        }
        break;
    }
    Retrieval {
        chunks: packed,
        total_tokens: used,
        truncated_to,
    }
}

/// Render chunks as the `<code_context>` block placed in the prompt.
#[must_use]
pub fn format_as_context(chunks: &[SearchHit]) -> String {
    let mut out = String::from("<code_context>\n");
    for chunk in chunks {
        let meta = &chunk.metadata;
        let name = meta.entity_name.as_deref().unwrap_or(&meta.node_type);
        let _ = writeln!(
            out,
            "  <chunk file=\"{}\" lines=\"{}-{}\" name=\"{}\" score=\"{:.2}\">",
            meta.file_path, meta.line_start, meta.line_end, name, chunk.score,
        );
        out.push_str(&chunk.text);
        out.push_str("\n  </chunk>\n");
    }
    out.push_str("</code_context>");
    out
}

#[cfg(test)]
mod tests {
    use askcode_llm::mock::MockProvider;

    use super::*;
    use crate::chunker::Chunk;
    use crate::collection::EntryMetadata;
    use crate::embedder::EmbedderConfig;
    use crate::local::LocalVectorStore;

    fn hit(path: &str, text: &str, score: f32) -> SearchHit {
        SearchHit {
            id: path.into(),
            score,
            text: text.into(),
            metadata: EntryMetadata {
                file_path: path.into(),
                source_name: "s".into(),
                chunk_index: 0,
                line_start: 1,
                line_end: 5,
                language: None,
                node_type: "window".into(),
                entity_name: None,
                content_hash: String::new(),
            },
            seq: 0,
        }
    }

    #[test]
    fn estimate_tokens_counts_chars() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("abcdefgh"), 2);
        assert_eq!(estimate_tokens("ééééé"), 1);
    }

    #[test]
    fn pack_drops_lowest_ranked_first() {
        let hits = vec![
            hit("a.py", &"a".repeat(400), 0.9),
            hit("b.py", &"b".repeat(400), 0.8),
            hit("c.py", &"c".repeat(400), 0.7),
        ];
        // Each hit costs 100 + 20 tokens.
        let packed = pack(hits, 250);
        let paths: Vec<_> = packed.chunks.iter().map(|h| h.metadata.file_path.as_str()).collect();
        assert_eq!(paths, ["a.py", "b.py"]);
        assert_eq!(packed.total_tokens, 240);
    }

    #[test]
    fn pack_stops_at_first_misfit() {
        let hits = vec![
            hit("a.py", &"a".repeat(40), 0.9),
            hit("big.py", &"b".repeat(4000), 0.8),
            hit("c.py", &"c".repeat(40), 0.7),
        ];
        let packed = pack(hits, 200);
        assert_eq!(packed.chunks.len(), 1);
        assert_eq!(packed.chunks[0].metadata.file_path, "a.py");
    }

    #[test]
    fn oversized_best_hit_is_truncated() {
        let packed = pack(vec![hit("a.py", &"x".repeat(1000), 0.9)], 70);
        assert_eq!(packed.chunks.len(), 1);
        assert_eq!(packed.truncated_to, Some(200));
        assert!(packed.total_tokens <= 70);

        assert_eq!(packed.chunks[0].text.len(), 1000);
        let context = packed.context();
        assert!(context.contains(&format!("{}\n  </chunk>", "x".repeat(200))));
        assert!(!context.contains(&"x".repeat(201)));
    }

    #[test]
    fn fitting_hits_are_not_marked_truncated() {
        let packed = pack(vec![hit("a.py", "def a(): pass", 0.9)], 200);
        assert_eq!(packed.truncated_to, None);
        assert_eq!(packed.context(), format_as_context(&packed.chunks));
    }

    #[test]
    fn format_as_context_xml() {
        let xml = format_as_context(&[hit("src/lib.rs", "fn hello() {}", 0.856)]);
        assert!(xml.starts_with("<code_context>\n"));
        assert!(xml.contains("file=\"src/lib.rs\""));
        assert!(xml.contains("lines=\"1-5\""));
        assert!(xml.contains("name=\"window\""));
        assert!(xml.contains("score=\"0.86\""));
        assert!(xml.contains("fn hello() {}"));
        assert!(xml.ends_with("</code_context>"));
    }

    #[test]
    fn format_as_context_empty() {
        assert_eq!(format_as_context(&[]), "<code_context>\n</code_context>");
    }

    fn chain_with(
        store: Arc<dyn VectorStore>,
        provider: &MockProvider,
        config: RetrievalConfig,
    ) -> QaChain<MockProvider> {
        let embedder = Embedder::new(Arc::new(provider.clone()), EmbedderConfig::default());
        QaChain::new(
            store,
            SourceName::from("s"),
            "askcode_s",
            embedder,
            Arc::new(provider.clone()),
            config,
        )
    }

    async fn seeded_store(provider: &MockProvider, texts: &[(&str, &str)]) -> Arc<dyn VectorStore> {
        let store: Arc<dyn VectorStore> = Arc::new(LocalVectorStore::new());
        let embedder = Embedder::new(Arc::new(provider.clone()), EmbedderConfig::default());
        let col = CodeCollection::reuse_or_create(
            Arc::clone(&store),
            SourceName::from("s"),
            "askcode_s",
            &embedder,
        )
        .await
        .unwrap();
        let entries = texts
            .iter()
            .map(|(path, text)| {
                let chunk = Chunk {
                    file_path: (*path).into(),
                    index: 0,
                    line_range: (1, text.lines().count().max(1)),
                    text: (*text).into(),
                    language: None,
                    node_type: "file".into(),
                    entity_name: None,
                    scope_chain: String::new(),
                    imports: String::new(),
                    content_hash: String::new(),
                    parent_summary: None,
                };
                col.entry(&chunk, provider.vector_for(text))
            })
            .collect();
        col.upsert(entries).await.unwrap();
        provider.reset_counters();
        store
    }

    #[tokio::test]
    async fn missing_collection_is_no_index() {
        let provider = MockProvider::default();
        let chain = chain_with(
            Arc::new(LocalVectorStore::new()),
            &provider,
            RetrievalConfig::default(),
        );
        assert!(matches!(chain.ask("anything?").await, Err(IndexError::NoIndex)));
        assert_eq!(provider.embed_calls(), 0);
        assert_eq!(provider.chat_calls(), 0);
    }

    #[tokio::test]
    async fn empty_collection_is_no_index() {
        let provider = MockProvider::default();
        let store = seeded_store(&provider, &[]).await;
        let chain = chain_with(store, &provider, RetrievalConfig::default());
        assert!(matches!(chain.retrieve("anything?").await, Err(IndexError::NoIndex)));
    }

    #[tokio::test]
    async fn sources_are_exactly_the_prompted_chunks() {
        let provider = MockProvider::with_responses(vec!["It parses tokens.".into()]).with_dimension(1024);
        let store = seeded_store(
            &provider,
            &[
                ("lexer.py", "def tokenize source tokens"),
                ("render.py", "def paint canvas pixels"),
            ],
        )
        .await;
        let config = RetrievalConfig {
            score_threshold: 0.3,
            ..RetrievalConfig::default()
        };
        let chain = chain_with(store, &provider, config);

        let answer = chain.ask("tokenize source tokens").await.unwrap();
        assert_eq!(answer.text, "It parses tokens.");
        assert_eq!(answer.sources.len(), 1);
        assert_eq!(answer.sources[0].metadata.file_path, "lexer.py");

        let prompts = provider.prompts();
        assert_eq!(prompts.len(), 1);
        let user = &prompts[0][1].content;
        assert!(user.contains("file=\"lexer.py\""));
        assert!(!user.contains("render.py"));
        assert!(user.ends_with("Question: tokenize source tokens"));
        assert_eq!(provider.embed_calls(), 1);
    }

    #[tokio::test]
    async fn generation_failure_is_not_retried() {
        let provider = MockProvider::failing();
        let store = seeded_store(&provider, &[("a.py", "def a(): pass")]).await;
        let chain = chain_with(store, &provider, RetrievalConfig::default());
        assert!(matches!(chain.ask("def a").await, Err(IndexError::Generation(_))));
        assert_eq!(provider.chat_calls(), 1);
    }

    #[tokio::test]
    async fn slow_generation_times_out() {
        let provider = MockProvider::default().with_delay(500);
        let store = seeded_store(&provider, &[("a.py", "def a(): pass")]).await;
        let config = RetrievalConfig {
            llm_timeout: Duration::from_millis(20),
            ..RetrievalConfig::default()
        };
        let chain = chain_with(store, &provider, config);
        let err = chain.ask("def a").await.unwrap_err();
        assert!(matches!(err, IndexError::Generation(LlmError::Timeout { .. })));
    }

    #[tokio::test]
    async fn top_k_bounds_sources() {
        let provider = MockProvider::default();
        let texts: Vec<(String, String)> = (0..10)
            .map(|i| (format!("f{i}.py"), format!("shared words here variant{i}")))
            .collect();
        let borrowed: Vec<(&str, &str)> =
            texts.iter().map(|(p, t)| (p.as_str(), t.as_str())).collect();
        let store = seeded_store(&provider, &borrowed).await;
        let config = RetrievalConfig {
            top_k: 3,
            score_threshold: 0.0,
            ..RetrievalConfig::default()
        };
        let chain = chain_with(store, &provider, config);
        let retrieval = chain.retrieve("shared words here").await.unwrap();
        assert_eq!(retrieval.chunks.len(), 3);
        assert!(
            retrieval
                .chunks
                .windows(2)
                .all(|w| w[0].score >= w[1].score)
        );
    }
}
