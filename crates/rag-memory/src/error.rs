//! Error taxonomy for the retrieval core
//!
//! Store-level code works in `anyhow::Result`; anything crossing a component
//! boundary (cache, retriever, memory manager, orchestrator) is mapped into
//! a `RagError` so callers can tell degraded paths from hard failures.

use std::fmt::Display;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RagError {
    /// Malformed input, rejected before any external call is made.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Embedding, completion or vector index call failed after retries.
    #[error("{provider} provider unavailable: {message}")]
    ProviderUnavailable {
        provider: &'static str,
        message: String,
    },

    /// No retrieval source could be queried.
    #[error("retrieval unavailable: {0}")]
    RetrievalUnavailable(String),

    /// Operation tracking write failed. Only ever logged.
    #[error("operation tracking failed: {0}")]
    TrackingFailure(String),

    #[error("deadline exceeded during {0}")]
    DeadlineExceeded(&'static str),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

pub type RagResult<T> = Result<T, RagError>;

impl RagError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn provider(provider: &'static str, err: impl Display) -> Self {
        Self::ProviderUnavailable {
            provider,
            message: err.to_string(),
        }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// Machine-readable code, used as a metrics label.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::ProviderUnavailable { .. } => "provider_unavailable",
            Self::RetrievalUnavailable(_) => "retrieval_unavailable",
            Self::TrackingFailure(_) => "tracking_failure",
            Self::DeadlineExceeded(_) => "deadline_exceeded",
            Self::NotFound { .. } => "not_found",
            Self::Storage(_) => "storage",
        }
    }
}
