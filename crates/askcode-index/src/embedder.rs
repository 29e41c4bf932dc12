//! Order-preserving batched embedding with bounded concurrency.

use std::sync::Arc;
use std::time::Duration;

use askcode_llm::LlmError;
use askcode_llm::provider::LlmProvider;
use futures::{StreamExt, TryStreamExt, stream};

#[derive(Debug, Clone)]
pub struct EmbedderConfig {
    pub batch_size: usize,
    /// Batches in flight at once.
    pub concurrency: usize,
    pub timeout: Duration,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            concurrency: 4,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Wraps an embedding backend so that output `i` always belongs to input `i`.
///
/// A batch that fails, times out, or returns a wrong count or dimension fails
/// the whole call; no partial results are returned.
pub struct Embedder<P: LlmProvider> {
    provider: Arc<P>,
    config: EmbedderConfig,
}

impl<P: LlmProvider> Clone for Embedder<P> {
    fn clone(&self) -> Self {
        Self {
            provider: Arc::clone(&self.provider),
            config: self.config.clone(),
        }
    }
}

impl<P: LlmProvider> Embedder<P> {
    #[must_use]
    pub fn new(provider: Arc<P>, config: EmbedderConfig) -> Self {
        Self { provider, config }
    }

    #[must_use]
    pub fn provider(&self) -> &Arc<P> {
        &self.provider
    }

    /// # Errors
    ///
    /// Returns the first batch error, a `Timeout`, or an `EmbeddingCount` /
    /// dimension mismatch.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let batch_size = self.config.batch_size.max(1);
        let concurrency = self.config.concurrency.max(1);

        let pending: Vec<_> = texts
            .chunks(batch_size)
            .map(|batch| self.embed_batch(batch))
            .collect();
        let batches: Vec<Vec<Vec<f32>>> = stream::iter(pending)
            .buffered(concurrency)
            .try_collect()
            .await?;

        let vectors: Vec<Vec<f32>> = batches.into_iter().flatten().collect();
        if vectors.len() != texts.len() {
            return Err(LlmError::EmbeddingCount {
                provider: self.provider.name().to_owned(),
                expected: texts.len(),
                got: vectors.len(),
            });
        }
        if let Some(first) = vectors.first()
            && vectors.iter().any(|v| v.len() != first.len())
        {
            return Err(LlmError::Other(format!(
                "{} returned vectors of inconsistent dimensionality",
                self.provider.name()
            )));
        }
        Ok(vectors)
    }

    /// # Errors
    ///
    /// Same as [`Embedder::embed`].
    pub async fn embed_one(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let mut vectors = self.embed(&[text.to_owned()]).await?;
        vectors.pop().ok_or(LlmError::EmptyResponse {
            provider: self.provider.name().to_owned(),
        })
    }

    /// Probe the backend for its vector dimensionality.
    ///
    /// # Errors
    ///
    /// Returns an error if the probe request fails or yields an empty vector.
    pub async fn dimension(&self) -> Result<usize, LlmError> {
        let probe = self.embed_one("dimension probe").await?;
        if probe.is_empty() {
            return Err(LlmError::EmptyResponse {
                provider: self.provider.name().to_owned(),
            });
        }
        Ok(probe.len())
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        let timeout = self.config.timeout;
        let vectors = tokio::time::timeout(timeout, self.provider.embed_batch(batch))
            .await
            .map_err(|_| LlmError::Timeout {
                provider: self.provider.name().to_owned(),
                secs: timeout.as_secs(),
            })??;
        if vectors.len() != batch.len() {
            return Err(LlmError::EmbeddingCount {
                provider: self.provider.name().to_owned(),
                expected: batch.len(),
                got: vectors.len(),
            });
        }
        tracing::trace!(batch = batch.len(), "embedded batch");
        Ok(vectors)
    }
}
