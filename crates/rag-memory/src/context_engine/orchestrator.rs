//! Answers a query: store it, retrieve, record, complete, store the reply

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use super::context_builder::{ContextBuilder, ContextBuilderConfig};
use super::memory_manager::MemoryManager;
use super::retriever::{RankedContext, RetrievalFilters, RetrievalRequest, Retriever};
use crate::error::{RagError, RagResult};
use crate::memory_db::{Message, Role};
use crate::providers::{CompletionOptions, CompletionProvider, Prompt};
use crate::tracking::{OperationTracker, TrackingHandle};
use crate::utils::TextUtils;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub completion: CompletionOptions,
    /// Characters of summaries plus recent messages placed in the prompt
    pub history_budget_chars: usize,
    /// Applied when a request carries no deadline of its own
    pub default_deadline: Duration,
    pub context_builder: ContextBuilderConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            completion: CompletionOptions::default(),
            history_budget_chars: 4000,
            default_deadline: Duration::from_secs(30),
            context_builder: ContextBuilderConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.history_budget_chars == 0 {
            anyhow::bail!("history_budget_chars must be positive");
        }
        if self.default_deadline.is_zero() {
            anyhow::bail!("default_deadline must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct AnswerRequest {
    pub query: String,
    pub user_id: String,
    /// When set, the query and the reply are appended to this conversation
    pub conversation_id: Option<String>,
    pub top_k: Option<usize>,
    pub filters: RetrievalFilters,
    pub deadline: Option<Duration>,
}

impl AnswerRequest {
    pub fn new(query: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[derive(Debug)]
pub struct Answer {
    pub text: String,
    pub context: RankedContext,
    pub user_message: Option<Message>,
    pub assistant_message: Option<Message>,
    /// Write of the retrieval record, already under way
    pub tracking: TrackingHandle,
}

impl Answer {
    pub fn operation_id(&self) -> &str {
        &self.tracking.operation_id
    }

    pub fn is_degraded(&self) -> bool {
        self.context.is_degraded()
    }
}

pub type FragmentStream = Pin<Box<dyn Stream<Item = RagResult<String>> + Send>>;

/// Streaming answer; the reply is stored once `fragments` is drained
pub struct AnswerStream {
    pub context: RankedContext,
    pub user_message: Option<Message>,
    pub tracking: TrackingHandle,
    pub fragments: FragmentStream,
}

impl AnswerStream {
    pub fn operation_id(&self) -> &str {
        &self.tracking.operation_id
    }
}

/// Everything settled before the completion call
struct Prepared {
    context: RankedContext,
    user_message: Option<Message>,
    tracking: TrackingHandle,
    prompt: Prompt,
    deadline: Instant,
}

pub struct CompletionOrchestrator {
    memory: Arc<MemoryManager>,
    retriever: Arc<Retriever>,
    tracker: Arc<OperationTracker>,
    completion: Arc<dyn CompletionProvider>,
    builder: ContextBuilder,
    config: OrchestratorConfig,
}

impl CompletionOrchestrator {
    pub fn new(
        memory: Arc<MemoryManager>,
        retriever: Arc<Retriever>,
        tracker: Arc<OperationTracker>,
        completion: Arc<dyn CompletionProvider>,
        config: OrchestratorConfig,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        info!("Completion orchestrator initialized (model {})", config.completion.model);
        Ok(Self {
            memory,
            retriever,
            tracker,
            completion,
            builder: ContextBuilder::new(config.context_builder.clone()),
            config,
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Reject a request before anything is stored or sent to a provider
    fn validate(&self, request: &AnswerRequest, retrieval: &RetrievalRequest) -> RagResult<()> {
        if request.deadline.is_some_and(|d| d.is_zero()) {
            return Err(RagError::validation("deadline must be positive"));
        }
        self.retriever.validate_request(retrieval)?;
        Ok(())
    }

    async fn prepare(&self, request: &AnswerRequest) -> RagResult<Prepared> {
        let retrieval = RetrievalRequest {
            query: request.query.clone(),
            user_id: request.user_id.clone(),
            conversation_id: request.conversation_id.clone(),
            top_k: request.top_k,
            filters: request.filters.clone(),
            budget_chars: None,
        };
        self.validate(request, &retrieval)?;
        let deadline = Instant::now() + request.deadline.unwrap_or(self.config.default_deadline);

        let user_message = match &request.conversation_id {
            Some(conversation_id) => {
                let outcome = timeout_at(
                    deadline,
                    self.memory.append_message(conversation_id, Role::User, &request.query),
                )
                .await
                .map_err(|_| RagError::DeadlineExceeded("memory"))??;
                Some(outcome.message)
            }
            None => None,
        };

        let context = timeout_at(deadline, self.retriever.retrieve(&retrieval))
            .await
            .map_err(|_| RagError::DeadlineExceeded("retrieval"))??;

        // Retrieval is complete, so it is recorded whatever happens next
        let tracking = self
            .tracker
            .record(&context, user_message.as_ref().map(|m| m.id.as_str()));

        let history = match &request.conversation_id {
            Some(conversation_id) => Some(
                self.memory
                    .active_context(conversation_id, self.config.history_budget_chars)?,
            ),
            None => None,
        };
        let prompt = self.builder.build_prompt(
            &request.query,
            &context,
            history.as_ref(),
            user_message.as_ref().map(|m| m.id.as_str()),
        );

        Ok(Prepared {
            context,
            user_message,
            tracking,
            prompt,
            deadline,
        })
    }

    pub async fn answer(&self, request: AnswerRequest) -> RagResult<Answer> {
        let prepared = self.prepare(&request).await?;

        let text = match timeout_at(
            prepared.deadline,
            self.completion.complete(&prepared.prompt, &self.config.completion),
        )
        .await
        {
            Err(_) => {
                warn!("Completion for operation {} exceeded its deadline", prepared.tracking.operation_id);
                return Err(RagError::DeadlineExceeded("completion"));
            }
            Ok(Err(e)) => return Err(RagError::provider("completion", e)),
            Ok(Ok(text)) if text.trim().is_empty() => {
                return Err(RagError::provider("completion", "empty completion"));
            }
            Ok(Ok(text)) => text,
        };

        let assistant_message = match &request.conversation_id {
            Some(conversation_id) => Some(
                self.memory
                    .append_message(conversation_id, Role::Assistant, &text)
                    .await?
                    .message,
            ),
            None => None,
        };

        debug!(
            "Answered operation {} with {} chars ({} context items)",
            prepared.tracking.operation_id,
            TextUtils::char_len(&text),
            prepared.context.selected_count
        );
        Ok(Answer {
            text,
            context: prepared.context,
            user_message: prepared.user_message,
            assistant_message,
            tracking: prepared.tracking,
        })
    }

    /// Stream the completion. Fragments are forwarded unchanged; the joined
    /// reply is appended to the conversation after the last one.
    pub async fn answer_stream(&self, request: AnswerRequest) -> RagResult<AnswerStream> {
        let prepared = self.prepare(&request).await?;
        let deadline = prepared.deadline;

        let completion_stream = timeout_at(
            deadline,
            self.completion.complete_stream(&prepared.prompt, &self.config.completion),
        )
        .await
        .map_err(|_| RagError::DeadlineExceeded("completion"))?
        .map_err(|e| RagError::provider("completion", e))?;

        let memory = Arc::clone(&self.memory);
        let conversation_id = request.conversation_id.clone();
        let operation_id = prepared.tracking.operation_id.clone();

        let fragments = async_stream::stream! {
            let mut full_response = String::new();
            let mut failed = false;
            futures_util::pin_mut!(completion_stream);

            loop {
                match timeout_at(deadline, completion_stream.next()).await {
                    Err(_) => {
                        warn!("Streamed completion for operation {} exceeded its deadline", operation_id);
                        yield Err(RagError::DeadlineExceeded("completion"));
                        failed = true;
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(e))) => {
                        yield Err(RagError::provider("completion", e));
                        failed = true;
                        break;
                    }
                    Ok(Some(Ok(fragment))) => {
                        full_response.push_str(&fragment);
                        yield Ok(fragment);
                    }
                }
            }

            if !failed && !full_response.trim().is_empty() {
                if let Some(conversation_id) = conversation_id {
                    match memory.append_message(&conversation_id, Role::Assistant, &full_response).await {
                        Ok(_) => debug!(
                            "Persisted streamed reply ({} chars) for conversation {}",
                            TextUtils::char_len(&full_response),
                            conversation_id
                        ),
                        Err(e) => {
                            warn!("Failed to persist streamed reply for {}: {}", conversation_id, e);
                            yield Err(e);
                        }
                    }
                }
            }
        };

        Ok(AnswerStream {
            context: prepared.context,
            user_message: prepared.user_message,
            tracking: prepared.tracking,
            fragments: Box::pin(fragments),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache_management::{EmbeddingCache, EmbeddingCacheConfig};
    use crate::context_engine::{ExtractiveSummarizer, RetrieverConfig, SummarizationConfig};
    use crate::knowledge::{ChunkConfig, KnowledgeStore, NewKnowledgeItem};
    use crate::memory_db::{MemoryDatabase, OperationFilter, TimeRange};
    use crate::providers::{CompletionStream, HashingEmbeddingProvider};
    use crate::utils::ManualClock;
    use crate::vector_index::{InMemoryVectorIndex, VectorIndex};
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};

    enum Behaviour {
        Reply(&'static str),
        Fail,
        Hang,
        Fragments(Vec<&'static str>),
    }

    struct MockCompletion(Behaviour);

    #[async_trait]
    impl CompletionProvider for MockCompletion {
        async fn complete(&self, _prompt: &Prompt, _options: &CompletionOptions) -> anyhow::Result<String> {
            match &self.0 {
                Behaviour::Reply(text) => Ok(text.to_string()),
                Behaviour::Fail => anyhow::bail!("model server unreachable"),
                Behaviour::Hang => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok("too late".to_string())
                }
                Behaviour::Fragments(parts) => Ok(parts.concat()),
            }
        }

        async fn complete_stream(
            &self,
            prompt: &Prompt,
            options: &CompletionOptions,
        ) -> anyhow::Result<CompletionStream> {
            match &self.0 {
                Behaviour::Fragments(parts) => {
                    let items: Vec<anyhow::Result<String>> = parts.iter().map(|p| Ok(p.to_string())).collect();
                    Ok(Box::pin(futures::stream::iter(items)))
                }
                _ => {
                    let text = self.complete(prompt, options).await?;
                    Ok(Box::pin(futures::stream::once(async move { Ok(text) })))
                }
            }
        }
    }

    struct Fixture {
        orchestrator: CompletionOrchestrator,
        db: Arc<MemoryDatabase>,
        memory: Arc<MemoryManager>,
        tracker: Arc<OperationTracker>,
        knowledge: KnowledgeStore,
    }

    fn fixture(behaviour: Behaviour) -> Fixture {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()));
        let db = Arc::new(MemoryDatabase::new_in_memory().unwrap());
        let cache = Arc::new(
            EmbeddingCache::new(
                Arc::new(HashingEmbeddingProvider::new(256)),
                &EmbeddingCacheConfig::default(),
                clock.clone(),
            )
            .unwrap(),
        );
        let index: Arc<dyn VectorIndex> = Arc::new(InMemoryVectorIndex::new());
        let memory = Arc::new(
            MemoryManager::new(
                db.clone(),
                cache.clone(),
                index.clone(),
                Arc::new(ExtractiveSummarizer::default()),
                SummarizationConfig::default(),
                "hash-256",
                clock.clone(),
                Duration::from_secs(1),
            )
            .unwrap(),
        );
        let retriever = Arc::new(
            Retriever::new(
                db.clone(),
                cache.clone(),
                index.clone(),
                memory.clone(),
                RetrieverConfig::default(),
                "hash-256",
                clock.clone(),
            )
            .unwrap(),
        );
        let tracker = Arc::new(OperationTracker::new(db.clone(), "hash-256", clock.clone()));
        let knowledge = KnowledgeStore::new(
            db.clone(),
            cache,
            index,
            ChunkConfig::default(),
            "hash-256",
            clock,
            Duration::from_secs(1),
        )
        .unwrap();
        let orchestrator = CompletionOrchestrator::new(
            memory.clone(),
            retriever,
            tracker.clone(),
            Arc::new(MockCompletion(behaviour)),
            OrchestratorConfig::default(),
        )
        .unwrap();
        Fixture {
            orchestrator,
            db,
            memory,
            tracker,
            knowledge,
        }
    }

    async fn seed(fixture: &Fixture) {
        fixture
            .knowledge
            .create(NewKnowledgeItem {
                id: Some("paris".to_string()),
                owner_id: "u1".to_string(),
                title: None,
                content: "Paris is the capital of France.".to_string(),
            })
            .await
            .unwrap();
    }

    async fn stored_operations(tracker: &OperationTracker) -> usize {
        let range = TimeRange::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 2, 0, 0, 0).unwrap(),
        );
        for _ in 0..100 {
            let ops = tracker.list_operations(&OperationFilter::for_user("u1"), &range).unwrap();
            if !ops.is_empty() {
                return ops.len();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        0
    }

    #[tokio::test]
    async fn test_answer_stores_turns_and_records_retrieval() {
        let fixture = fixture(Behaviour::Reply("Paris."));
        seed(&fixture).await;
        let conversation = fixture.memory.create_conversation(Some("u1"), None).unwrap();

        let request = AnswerRequest::new("What is the capital of France?", "u1").in_conversation(&conversation.id);
        let answer = fixture.orchestrator.answer(request).await.unwrap();

        assert_eq!(answer.text, "Paris.");
        assert!(!answer.is_degraded());
        assert_eq!(answer.context.selected()[0].document_id, "paris#0");
        let user_message = answer.user_message.clone().unwrap();
        assert_eq!(answer.assistant_message.as_ref().unwrap().seq, user_message.seq + 1);

        let operation_id = answer.operation_id().to_string();
        assert!(answer.tracking.wait().await);
        let (operation, documents) = fixture.tracker.get_operation(&operation_id).unwrap();
        assert_eq!(operation.message_id.as_deref(), Some(user_message.id.as_str()));
        assert_eq!(documents[0].document_id, "paris#0");

        let messages = fixture.db.conversations.get_all_messages(&conversation.id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_completion_failure_still_records_retrieval() {
        let fixture = fixture(Behaviour::Fail);
        seed(&fixture).await;

        let err = fixture
            .orchestrator
            .answer(AnswerRequest::new("capital of France", "u1"))
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::ProviderUnavailable { provider: "completion", .. }));
        assert_eq!(stored_operations(&fixture.tracker).await, 1);
    }

    #[tokio::test]
    async fn test_completion_deadline() {
        let fixture = fixture(Behaviour::Hang);
        seed(&fixture).await;
        let conversation = fixture.memory.create_conversation(Some("u1"), None).unwrap();

        let request = AnswerRequest::new("capital of France", "u1")
            .in_conversation(&conversation.id)
            .with_deadline(Duration::from_millis(200));
        let err = fixture.orchestrator.answer(request).await.unwrap_err();
        assert!(matches!(err, RagError::DeadlineExceeded("completion")));
        assert_eq!(stored_operations(&fixture.tracker).await, 1);

        // The query was stored, no reply was
        let messages = fixture.db.conversations.get_all_messages(&conversation.id).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
    }

    #[tokio::test]
    async fn test_invalid_requests_are_rejected_before_storing() {
        let fixture = fixture(Behaviour::Reply("unused"));
        let conversation = fixture.memory.create_conversation(Some("u1"), None).unwrap();

        let empty = AnswerRequest::new("   ", "u1").in_conversation(&conversation.id);
        let mut zero_top_k = AnswerRequest::new("capital of France", "u1").in_conversation(&conversation.id);
        zero_top_k.top_k = Some(0);
        let mut no_sources = AnswerRequest::new("capital of France", "u1").in_conversation(&conversation.id);
        no_sources.filters.sources = Some(Vec::new());

        for request in [empty, zero_top_k, no_sources] {
            let err = fixture.orchestrator.answer(request).await.unwrap_err();
            assert!(matches!(err, RagError::Validation(_)), "unexpected error {err:?}");
        }
        assert!(fixture.db.conversations.get_all_messages(&conversation.id).unwrap().is_empty());

        let err = fixture
            .orchestrator
            .answer(AnswerRequest::new("capital of France", "u1").in_conversation("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_stream_forwards_fragments_and_stores_reply() {
        let fixture = fixture(Behaviour::Fragments(vec!["Par", "is", "."]));
        seed(&fixture).await;
        let conversation = fixture.memory.create_conversation(Some("u1"), None).unwrap();

        let request = AnswerRequest::new("capital of France", "u1").in_conversation(&conversation.id);
        let answer = fixture.orchestrator.answer_stream(request).await.unwrap();
        let fragments: Vec<String> = answer.fragments.map(|f| f.unwrap()).collect().await;
        assert_eq!(fragments, vec!["Par", "is", "."]);
        assert!(answer.tracking.wait().await);

        let messages = fixture.db.conversations.get_all_messages(&conversation.id).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].content, "Paris.");
    }
}
