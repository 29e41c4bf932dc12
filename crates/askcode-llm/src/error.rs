#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("rate limited")]
    RateLimited,

    #[error("provider unavailable")]
    Unavailable,

    /// The backend could not be reached or rejected the request.
    #[error("{provider} request failed: {message}")]
    Request { provider: String, message: String },

    #[error("request to {provider} timed out after {secs}s")]
    Timeout { provider: String, secs: u64 },

    #[error("empty response from {provider}")]
    EmptyResponse { provider: String },

    #[error("embedding not supported by {provider}")]
    EmbedUnsupported { provider: String },

    #[error("{provider} returned {got} embeddings for {expected} inputs")]
    EmbeddingCount {
        provider: String,
        expected: usize,
        got: usize,
    },

    #[error("{0}")]
    Other(String),
}

impl LlmError {
    /// Whether a retry of the same request may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited
            | Self::Unavailable
            | Self::Request { .. }
            | Self::Timeout { .. } => true,
            Self::Http(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, LlmError>;
