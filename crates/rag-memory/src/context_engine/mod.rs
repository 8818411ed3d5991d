//! Context engine: conversation memory, retrieval and answer assembly
//!
//! Flow for one query: `Retriever` embeds it and searches knowledge chunks
//! and conversation summaries, `ContextBuilder` lays the ranked result out
//! as a prompt, and `CompletionOrchestrator` drives the whole turn.

pub mod context_builder;
pub mod memory_manager;
pub mod orchestrator;
pub mod retriever;
pub mod summarizer;

pub use context_builder::{select_prefix, ContextBuilder, ContextBuilderConfig};
pub use memory_manager::{
    compare_scored, plan_eviction, ActiveContext, AppendOutcome, MemoryContext, MemoryManager, ScoredSummary,
    SummarizationConfig,
};
pub use orchestrator::{Answer, AnswerRequest, AnswerStream, CompletionOrchestrator, FragmentStream, OrchestratorConfig};
pub use retriever::{
    compare_ranked, DegradedSource, RankedContext, RankedItem, RetrievalFilters, RetrievalRequest, Retriever,
    RetrieverConfig,
};
pub use summarizer::{CompletionSummarizer, ExtractiveSummarizer, Summarizer, SummaryInput};
