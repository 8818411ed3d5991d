//! Turning message runs and lower-tier summaries into summary text
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::memory_db::{ConversationSummary, Message, Role, SummaryTier};
use crate::providers::{CompletionOptions, CompletionProvider, Prompt};
use crate::utils::TextUtils;

/// What a summary is built from: raw messages for short-term summaries,
/// lower-tier summaries for promotions
#[derive(Debug, Clone, Copy)]
pub enum SummaryInput<'a> {
    Messages(&'a [Message]),
    Summaries(&'a [ConversationSummary]),
}

impl SummaryInput<'_> {
    pub fn is_empty(&self) -> bool {
        match self {
            SummaryInput::Messages(m) => m.is_empty(),
            SummaryInput::Summaries(s) => s.is_empty(),
        }
    }

    fn transcript(&self) -> String {
        match self {
            SummaryInput::Messages(messages) => messages
                .iter()
                .map(|m| format!("{}: {}", m.role, m.content))
                .collect::<Vec<_>>()
                .join("\n"),
            SummaryInput::Summaries(summaries) => summaries
                .iter()
                .map(|s| format!("[messages {}-{}] {}", s.start_seq, s.end_seq, s.content))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, input: SummaryInput<'_>, tier: SummaryTier) -> anyhow::Result<String>;
}

/// Provider-free summarizer: the first sentence of every input, capped in length
#[derive(Debug, Clone)]
pub struct ExtractiveSummarizer {
    max_chars: usize,
}

impl ExtractiveSummarizer {
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars: max_chars.max(16),
        }
    }

    pub fn summarize_sync(&self, input: SummaryInput<'_>) -> anyhow::Result<String> {
        let lines: Vec<String> = match input {
            SummaryInput::Messages(messages) => messages
                .iter()
                .map(|m| (m.role, TextUtils::first_sentence(&m.content)))
                .filter(|(_, s)| !s.is_empty())
                .map(|(role, s)| format!("{}: {}", role, s))
                .collect(),
            SummaryInput::Summaries(summaries) => summaries
                .iter()
                .map(|s| TextUtils::first_sentence(&s.content))
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        };
        if lines.is_empty() {
            anyhow::bail!("nothing to summarize");
        }
        let joined = lines.join(" ");
        Ok(TextUtils::truncate_with_ellipsis(&joined, self.max_chars).into_owned())
    }
}

impl Default for ExtractiveSummarizer {
    fn default() -> Self {
        Self::new(1200)
    }
}

#[async_trait]
impl Summarizer for ExtractiveSummarizer {
    async fn summarize(&self, input: SummaryInput<'_>, _tier: SummaryTier) -> anyhow::Result<String> {
        self.summarize_sync(input)
    }
}

/// Summarizes with the completion model, falling back to extraction when
/// the model fails, times out or answers with nothing
pub struct CompletionSummarizer {
    provider: Arc<dyn CompletionProvider>,
    options: CompletionOptions,
    timeout: Duration,
    fallback: ExtractiveSummarizer,
}

impl CompletionSummarizer {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        options: CompletionOptions,
        timeout: Duration,
        fallback: ExtractiveSummarizer,
    ) -> Self {
        Self {
            provider,
            options,
            timeout,
            fallback,
        }
    }

    fn build_prompt(input: SummaryInput<'_>, tier: SummaryTier) -> Prompt {
        let instruction = match input {
            SummaryInput::Messages(_) => {
                "Summarize the following conversation excerpt. Keep names, facts, decisions and open questions. Reply with the summary only."
            }
            SummaryInput::Summaries(_) => {
                "Merge the following conversation summaries into one shorter summary. Keep names, facts and decisions. Reply with the summary only."
            }
        };
        let mut prompt = Prompt::default();
        prompt.push(Role::System, format!("{instruction} (tier: {tier})"));
        prompt.push(Role::User, input.transcript());
        prompt
    }
}

#[async_trait]
impl Summarizer for CompletionSummarizer {
    async fn summarize(&self, input: SummaryInput<'_>, tier: SummaryTier) -> anyhow::Result<String> {
        if input.is_empty() {
            anyhow::bail!("nothing to summarize");
        }
        let prompt = Self::build_prompt(input, tier);
        match tokio::time::timeout(self.timeout, self.provider.complete(&prompt, &self.options)).await {
            Ok(Ok(text)) if !text.trim().is_empty() => {
                debug!("Generated {} summary ({} chars)", tier, text.len());
                Ok(text.trim().to_string())
            }
            Ok(Ok(_)) => {
                warn!("Completion returned an empty {} summary, using extractive fallback", tier);
                self.fallback.summarize_sync(input)
            }
            Ok(Err(e)) => {
                warn!("Summary completion failed ({}), using extractive fallback", e);
                self.fallback.summarize_sync(input)
            }
            Err(_) => {
                warn!("Summary completion timed out after {:?}, using extractive fallback", self.timeout);
                self.fallback.summarize_sync(input)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn message(seq: i64, role: Role, content: &str) -> Message {
        Message {
            id: format!("m{seq}"),
            conversation_id: "c1".to_string(),
            seq,
            role,
            content: content.to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        }
    }

    struct FailingCompletion;

    #[async_trait]
    impl CompletionProvider for FailingCompletion {
        async fn complete(&self, _prompt: &Prompt, _options: &CompletionOptions) -> anyhow::Result<String> {
            anyhow::bail!("model offline")
        }
    }

    struct EchoCompletion;

    #[async_trait]
    impl CompletionProvider for EchoCompletion {
        async fn complete(&self, prompt: &Prompt, _options: &CompletionOptions) -> anyhow::Result<String> {
            Ok(format!("summary of {} messages", prompt.messages.len()))
        }
    }

    #[test]
    fn test_extractive_keeps_first_sentences() {
        let messages = vec![
            message(1, Role::User, "Where is Paris? I forgot."),
            message(2, Role::Assistant, "Paris is in France. It is the capital."),
        ];
        let summary = ExtractiveSummarizer::default()
            .summarize_sync(SummaryInput::Messages(&messages))
            .unwrap();
        assert_eq!(summary, "user: Where is Paris? assistant: Paris is in France.");
    }

    #[test]
    fn test_extractive_respects_length_cap() {
        let long = "word ".repeat(100);
        let messages = vec![message(1, Role::User, &long)];
        let summary = ExtractiveSummarizer::new(40)
            .summarize_sync(SummaryInput::Messages(&messages))
            .unwrap();
        assert!(summary.chars().count() <= 40);
    }

    #[tokio::test]
    async fn test_completion_summarizer_falls_back() {
        let summarizer = CompletionSummarizer::new(
            Arc::new(FailingCompletion),
            CompletionOptions::default(),
            Duration::from_secs(1),
            ExtractiveSummarizer::default(),
        );
        let messages = vec![message(1, Role::User, "Remember that my cat is called Tom.")];
        let summary = summarizer
            .summarize(SummaryInput::Messages(&messages), SummaryTier::ShortTerm)
            .await
            .unwrap();
        assert!(summary.contains("Tom"));
    }

    #[tokio::test]
    async fn test_completion_summarizer_uses_model_output() {
        let summarizer = CompletionSummarizer::new(
            Arc::new(EchoCompletion),
            CompletionOptions::default(),
            Duration::from_secs(1),
            ExtractiveSummarizer::default(),
        );
        let messages = vec![message(1, Role::User, "hello")];
        let summary = summarizer
            .summarize(SummaryInput::Messages(&messages), SummaryTier::ShortTerm)
            .await
            .unwrap();
        assert_eq!(summary, "summary of 2 messages");
    }
}
