//! Test-only mock provider.
//!
//! Embeddings are deterministic bag-of-words vectors: every lowercase word
//! is hashed into one of `dimension` buckets and the result is L2-normalized,
//! so texts sharing vocabulary score high under cosine similarity.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::LlmError;
use crate::provider::{LlmProvider, Message};

pub const DEFAULT_MOCK_DIMENSION: usize = 64;

#[derive(Debug, Clone)]
pub struct MockProvider {
    responses: Arc<Mutex<VecDeque<String>>>,
    pub default_response: String,
    pub dimension: usize,
    pub supports_embeddings: bool,
    pub fail_chat: bool,
    /// Milliseconds to sleep before answering a chat request.
    pub delay_ms: u64,
    transient_embed_failures: Arc<AtomicUsize>,
    fail_texts_containing: Option<String>,
    embed_calls: Arc<AtomicUsize>,
    chat_calls: Arc<AtomicUsize>,
    embedded: Arc<Mutex<Vec<String>>>,
    prompts: Arc<Mutex<Vec<Vec<Message>>>>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::new())),
            default_response: "mock response".into(),
            dimension: DEFAULT_MOCK_DIMENSION,
            supports_embeddings: true,
            fail_chat: false,
            delay_ms: 0,
            transient_embed_failures: Arc::new(AtomicUsize::new(0)),
            fail_texts_containing: None,
            embed_calls: Arc::new(AtomicUsize::new(0)),
            chat_calls: Arc::new(AtomicUsize::new(0)),
            embedded: Arc::new(Mutex::new(Vec::new())),
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockProvider {
    #[must_use]
    pub fn with_responses(responses: Vec<String>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn failing() -> Self {
        Self {
            fail_chat: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_delay(mut self, ms: u64) -> Self {
        self.delay_ms = ms;
        self
    }

    #[must_use]
    pub fn with_dimension(mut self, dimension: usize) -> Self {
        self.dimension = dimension.max(1);
        self
    }

    #[must_use]
    pub fn without_embeddings(mut self) -> Self {
        self.supports_embeddings = false;
        self
    }

    /// The next `n` embedding requests fail with a transient error.
    #[must_use]
    pub fn with_transient_embed_failures(self, n: usize) -> Self {
        self.transient_embed_failures.store(n, Ordering::SeqCst);
        self
    }

    /// Every embedding request with an input containing `needle` fails with a
    /// transient error, no matter how often it is retried.
    #[must_use]
    pub fn failing_embeddings_containing(mut self, needle: impl Into<String>) -> Self {
        self.fail_texts_containing = Some(needle.into());
        self
    }

    /// Number of embedding requests received (single or batched), including failed ones.
    #[must_use]
    pub fn embed_calls(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn chat_calls(&self) -> usize {
        self.chat_calls.load(Ordering::SeqCst)
    }

    /// All texts from successful embedding requests, in request order.
    #[must_use]
    pub fn embedded_texts(&self) -> Vec<String> {
        lock(&self.embedded).clone()
    }

    /// Message lists of every chat request, in request order.
    #[must_use]
    pub fn prompts(&self) -> Vec<Vec<Message>> {
        lock(&self.prompts).clone()
    }

    pub fn reset_counters(&self) {
        self.embed_calls.store(0, Ordering::SeqCst);
        self.chat_calls.store(0, Ordering::SeqCst);
        lock(&self.embedded).clear();
        lock(&self.prompts).clear();
    }

    /// The vector this provider returns for `text`.
    #[must_use]
    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        bag_of_words(text, self.dimension)
    }

    fn check_embed(&self, texts: &[String]) -> Result<(), LlmError> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        if !self.supports_embeddings {
            return Err(LlmError::EmbedUnsupported {
                provider: "mock".into(),
            });
        }
        let scripted = self
            .transient_embed_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if scripted {
            return Err(LlmError::Unavailable);
        }
        if let Some(needle) = &self.fail_texts_containing
            && texts.iter().any(|t| t.contains(needle.as_str()))
        {
            return Err(LlmError::Unavailable);
        }
        lock(&self.embedded).extend(texts.iter().cloned());
        Ok(())
    }
}

fn fnv1a(word: &str) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in word.bytes() {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

#[allow(clippy::cast_possible_truncation)]
fn bag_of_words(text: &str, dimension: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; dimension];
    for word in text
        .split(|c: char| !c.is_alphanumeric() && c != '_')
        .filter(|w| !w.is_empty())
    {
        let bucket = (fnv1a(&word.to_lowercase()) % dimension as u64) as usize;
        v[bucket] += 1.0;
    }
    let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        v[0] = 1.0;
    } else {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

impl LlmProvider for MockProvider {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "mock"
    }

    async fn chat(&self, messages: &[Message]) -> Result<String, LlmError> {
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.prompts).push(messages.to_vec());
        if self.delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(self.delay_ms)).await;
        }
        if self.fail_chat {
            return Err(LlmError::Other("mock LLM error".into()));
        }
        Ok(lock(&self.responses)
            .pop_front()
            .unwrap_or_else(|| self.default_response.clone()))
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        self.check_embed(&[text.to_owned()])?;
        Ok(self.vector_for(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        self.check_embed(texts)?;
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    fn supports_embeddings(&self) -> bool {
        self.supports_embeddings
    }
}
