//! External capabilities: text embedding and text completion
//!
//! Both are consumed through async traits so the core never depends on a
//! particular model server. HTTP clients speak the OpenAI-compatible
//! `/v1/embeddings` and `/v1/chat/completions` endpoints.

pub mod completion;
pub mod embedding;
pub mod resilience;

pub use completion::{
    CompletionOptions, CompletionProvider, CompletionStream, HttpCompletionProvider, Prompt, PromptMessage,
};
pub use embedding::{EmbeddingProvider, HashingEmbeddingProvider, HttpEmbeddingProvider};
pub use resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitState, ResilientEmbeddingProvider, RetryPolicy};

/// Non-success HTTP status from a provider endpoint
#[derive(Debug, thiserror::Error)]
#[error("{endpoint} returned {status}: {body}")]
pub struct ProviderHttpError {
    pub endpoint: &'static str,
    pub status: u16,
    pub body: String,
}

impl ProviderHttpError {
    /// Rate limiting and server faults are worth retrying; other client errors are not
    pub fn is_retryable(&self) -> bool {
        self.status == 429 || self.status >= 500
    }
}

/// Errors that are not classified HTTP failures (timeouts, resets) are retried
pub fn is_retryable(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<ProviderHttpError>() {
        Some(http) => http.is_retryable(),
        None => true,
    }
}

pub(crate) async fn check_status(
    endpoint: &'static str,
    response: reqwest::Response,
) -> anyhow::Result<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(ProviderHttpError { endpoint, status, body }.into())
}
