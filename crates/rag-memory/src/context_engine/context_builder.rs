//! Assembles retrieved context and conversation memory into a prompt

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::memory_manager::ActiveContext;
use super::retriever::{RankedContext, RankedItem};
use crate::memory_db::{RetrievalSource, Role};
use crate::providers::Prompt;
use crate::utils::TextUtils;

/// Longest prefix of `items` whose content fits in `budget_chars`.
///
/// Returns the prefix length and the characters it uses. An item that does
/// not fit ends the prefix; nothing after it is considered.
pub fn select_prefix(items: &[RankedItem], budget_chars: usize) -> (usize, usize) {
    let mut used = 0;
    for (idx, item) in items.iter().enumerate() {
        let len = TextUtils::char_len(&item.content);
        if used + len > budget_chars {
            return (idx, used);
        }
        used += len;
    }
    (items.len(), used)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextBuilderConfig {
    pub system_prompt: String,
    /// Shown instead of a context block when nothing was retrieved
    pub no_context_note: String,
    /// Shown when a retrieval source failed
    pub degraded_note: String,
}

impl Default for ContextBuilderConfig {
    fn default() -> Self {
        Self {
            system_prompt: "You are a helpful assistant. Answer using the provided context when it is relevant."
                .to_string(),
            no_context_note: "No stored knowledge matched this question.".to_string(),
            degraded_note: "Some stored knowledge could not be searched; the context may be incomplete."
                .to_string(),
        }
    }
}

pub struct ContextBuilder {
    config: ContextBuilderConfig,
}

impl ContextBuilder {
    pub fn new(config: ContextBuilderConfig) -> Self {
        Self { config }
    }

    /// Prompt layout:
    /// 1. system prompt with the numbered retrieved context
    /// 2. conversation summaries, oldest range first
    /// 3. unsummarized messages in order
    /// 4. the query, unless it is already the last of those messages
    pub fn build_prompt(
        &self,
        query: &str,
        retrieved: &RankedContext,
        history: Option<&ActiveContext>,
        query_message_id: Option<&str>,
    ) -> Prompt {
        let mut prompt = Prompt::default();
        prompt.push(Role::System, self.system_block(retrieved));

        let Some(history) = history else {
            prompt.push(Role::User, query);
            return prompt;
        };

        if !history.summaries.is_empty() {
            let lines: Vec<String> = history
                .summaries
                .iter()
                .map(|s| format!("- (messages {}-{}) {}", s.start_seq, s.end_seq, s.content))
                .collect();
            prompt.push(
                Role::System,
                format!("Earlier in this conversation:\n{}", lines.join("\n")),
            );
        }
        for message in &history.recent_messages {
            prompt.push(message.role, message.content.clone());
        }

        let query_included = match (history.recent_messages.last(), query_message_id) {
            (Some(last), Some(id)) => last.id == id,
            _ => false,
        };
        if !query_included {
            prompt.push(Role::User, query);
        }
        debug!(
            "Built prompt with {} messages ({} chars)",
            prompt.messages.len(),
            prompt.char_len()
        );
        prompt
    }

    fn system_block(&self, retrieved: &RankedContext) -> String {
        let mut block = self.config.system_prompt.clone();
        let selected = retrieved.selected();
        if selected.is_empty() {
            block.push_str("\n\n");
            block.push_str(&self.config.no_context_note);
        } else {
            block.push_str("\n\nContext:");
            for (idx, item) in selected.iter().enumerate() {
                let label = match item.source {
                    RetrievalSource::Knowledge => "document",
                    RetrievalSource::Memory => "conversation memory",
                };
                block.push_str(&format!("\n[{}] ({}) {}", idx + 1, label, item.content));
            }
        }
        if retrieved.is_degraded() {
            block.push_str("\n\n");
            block.push_str(&self.config.degraded_note);
        }
        block
    }
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self::new(ContextBuilderConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context_engine::DegradedSource;
    use crate::memory_db::{DocumentMetadata, Message};
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn item(id: &str, content: &str) -> RankedItem {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        RankedItem {
            document_id: id.to_string(),
            source: RetrievalSource::Knowledge,
            score: 0.9,
            content: content.to_string(),
            metadata: DocumentMetadata::knowledge_chunk("u1", id, 0, at),
            updated_at: at,
        }
    }

    fn context(items: Vec<RankedItem>) -> RankedContext {
        let (selected_count, used_chars) = select_prefix(&items, 1000);
        RankedContext {
            query: "q".to_string(),
            user_id: "u1".to_string(),
            conversation_id: None,
            embedding_key: "k".to_string(),
            normalized_query: "q".to_string(),
            items,
            selected_count,
            used_chars,
            sources_queried: vec![RetrievalSource::Knowledge],
            degraded: Vec::new(),
            started_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            elapsed: Duration::from_millis(3),
        }
    }

    #[test]
    fn test_select_prefix_stops_at_first_misfit() {
        let items = vec![item("a", "12345"), item("b", "1234567890"), item("c", "1")];
        assert_eq!(select_prefix(&items, 20), (3, 16));
        assert_eq!(select_prefix(&items, 10), (1, 5));
        assert_eq!(select_prefix(&items, 4), (0, 0));
        assert_eq!(select_prefix(&[], 4), (0, 0));
    }

    #[test]
    fn test_prompt_lists_context_and_query() {
        let builder = ContextBuilder::default();
        let retrieved = context(vec![item("k1#0", "Paris is the capital of France.")]);
        let prompt = builder.build_prompt("What is the capital of France?", &retrieved, None, None);
        assert_eq!(prompt.messages.len(), 2);
        assert!(prompt.messages[0].content.contains("[1] (document) Paris is the capital of France."));
        assert_eq!(prompt.messages[1].role, Role::User);
    }

    #[test]
    fn test_prompt_does_not_repeat_stored_query() {
        let builder = ContextBuilder::default();
        let mut retrieved = context(Vec::new());
        retrieved.degraded.push(DegradedSource {
            source: RetrievalSource::Memory,
            reason: "timeout".to_string(),
        });
        let query = Message {
            id: "m1".to_string(),
            conversation_id: "c1".to_string(),
            seq: 1,
            role: Role::User,
            content: "hello".to_string(),
            created_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        };
        let history = ActiveContext {
            summaries: Vec::new(),
            recent_messages: vec![query],
            evicted: Vec::new(),
        };
        let prompt = builder.build_prompt("hello", &retrieved, Some(&history), Some("m1"));
        assert_eq!(prompt.messages.len(), 2);
        assert!(prompt.messages[0].content.contains("may be incomplete"));
        assert!(prompt.messages[0].content.contains("No stored knowledge"));
    }
}
