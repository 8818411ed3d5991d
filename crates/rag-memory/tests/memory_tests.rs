//! Conversation Memory Tests
//!
//! Hierarchical summarization as seen from outside the memory manager:
//! - summary trigger and cursor
//! - concurrent appends drain the whole backlog
//! - promotion between tiers keeps ranges disjoint and ordered
//! - eviction order and retention
//! - memory retrieval touches what it returns
//! - embedding backfill after an index outage

mod common;

use common::{at, ControlledIndex, Harness, SlowSummarizer};
use rag_memory::context_engine::{plan_eviction, SummarizationConfig};
use rag_memory::memory_db::{ConversationSummary, Role, SummaryTier};
use rag_memory::vector_index::VectorIndex;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

async fn fill(h: &Harness, conversation_id: &str, count: u32) {
    for i in 1..=count {
        let role = if i % 2 == 1 { Role::User } else { Role::Assistant };
        let content = format!("Message {i}: notes about the garden, the roses and the tomatoes.");
        h.memory
            .append_message_at(conversation_id, role, &content, at(i, 0))
            .await
            .unwrap();
    }
}

fn summary(id: &str, tier: SummaryTier, seqs: (i64, i64), priority: u8, accessed_minute: u32) -> ConversationSummary {
    ConversationSummary {
        id: id.to_string(),
        conversation_id: "c1".to_string(),
        content: "s".repeat(100),
        tier,
        start_message_id: format!("m{}", seqs.0),
        end_message_id: format!("m{}", seqs.1),
        start_seq: seqs.0,
        end_seq: seqs.1,
        embedding_ref: None,
        superseded_by: None,
        created_at: at(0, 0),
        priority,
        last_accessed: at(accessed_minute, 0),
    }
}

// =============================================================================
// SUMMARY TRIGGER
// =============================================================================

#[tokio::test]
async fn test_twenty_five_messages_with_threshold_ten() {
    let h = Harness::new(SummarizationConfig {
        threshold: 10,
        ..Default::default()
    });
    let conversation = h.memory.create_conversation(Some("u1"), None).unwrap();
    fill(&h, &conversation.id, 25).await;

    let summaries = h.db.summaries.get_all_summaries(&conversation.id).unwrap();
    let ranges: Vec<(i64, i64)> = summaries.iter().map(|s| (s.start_seq, s.end_seq)).collect();
    assert_eq!(ranges, vec![(1, 10), (11, 20)]);
    assert!(summaries.iter().all(|s| s.tier == SummaryTier::ShortTerm));
    assert!(summaries.iter().all(|s| s.embedding_ref.is_some()));

    let conversation = h.memory.get_conversation(&conversation.id).unwrap();
    assert_eq!(conversation.last_summarized_seq, 20);
    assert_eq!(conversation.last_summarized_at, Some(at(20, 0)));

    let active = h.memory.active_context(&conversation.id, 100_000).unwrap();
    let unsummarized: Vec<i64> = active.recent_messages.iter().map(|m| m.seq).collect();
    assert_eq!(unsummarized, vec![21, 22, 23, 24, 25]);
    assert_eq!(active.summaries.len(), 2);
}

#[tokio::test]
async fn test_concurrent_appends_summarize_every_full_batch() {
    let summarizer = Arc::new(SlowSummarizer::new(Duration::from_millis(50)));
    let h = Harness::with_summarizer(
        SummarizationConfig {
            threshold: 10,
            ..Default::default()
        },
        summarizer.clone(),
    );
    let conversation = h.memory.create_conversation(Some("u1"), None).unwrap();

    let appends = (1..=20u32).map(|i| {
        let memory = h.memory.clone();
        let conversation_id = conversation.id.clone();
        async move {
            let content = format!("Message {i}: the hedge needs trimming before spring.");
            memory
                .append_message_at(&conversation_id, Role::User, &content, at(i, 0))
                .await
        }
    });
    for outcome in join_all(appends).await {
        outcome.unwrap();
    }

    let summaries = h.db.summaries.get_all_summaries(&conversation.id).unwrap();
    let ranges: Vec<(i64, i64)> = summaries.iter().map(|s| (s.start_seq, s.end_seq)).collect();
    assert_eq!(ranges, vec![(1, 10), (11, 20)]);
    let conversation = h.memory.get_conversation(&conversation.id).unwrap();
    assert_eq!(conversation.last_summarized_seq, 20);
    assert!(summarizer.calls() >= 2);
}

#[tokio::test]
async fn test_tier_ranges_are_disjoint_and_increasing() {
    let h = Harness::new(SummarizationConfig {
        threshold: 2,
        max_short_term: 2,
        max_medium_term: 2,
        promotion_batch: 2,
        ..Default::default()
    });
    let conversation = h.memory.create_conversation(Some("u1"), None).unwrap();
    fill(&h, &conversation.id, 40).await;

    let summaries = h.db.summaries.get_all_summaries(&conversation.id).unwrap();
    let mut by_tier: HashMap<SummaryTier, Vec<&ConversationSummary>> = HashMap::new();
    for s in &summaries {
        by_tier.entry(s.tier).or_default().push(s);
    }
    assert!(by_tier.contains_key(&SummaryTier::MediumTerm));
    assert!(by_tier.contains_key(&SummaryTier::LongTerm));

    for (tier, mut list) in by_tier {
        list.sort_by_key(|s| s.start_seq);
        for s in &list {
            assert!(s.start_seq <= s.end_seq, "{tier}: inverted range");
        }
        for pair in list.windows(2) {
            assert!(
                pair[0].end_seq < pair[1].start_seq,
                "{tier}: {}..{} overlaps {}..{}",
                pair[0].start_seq,
                pair[0].end_seq,
                pair[1].start_seq,
                pair[1].end_seq
            );
        }
    }

    // Promoted summaries cover the union of their inputs
    for s in summaries.iter().filter(|s| s.superseded_by.is_some()) {
        let parent = summaries
            .iter()
            .find(|p| Some(&p.id) == s.superseded_by.as_ref())
            .unwrap();
        assert!(parent.start_seq <= s.start_seq && s.end_seq <= parent.end_seq);
    }

    // Only active summaries keep a vector
    let active = summaries.iter().filter(|s| s.is_active()).count();
    assert_eq!(h.index.len().await.unwrap(), active);
}

// =============================================================================
// EVICTION
// =============================================================================

#[test]
fn test_eviction_drops_low_priority_before_lower_tier() {
    let summaries = vec![
        summary("t1-p2", SummaryTier::MediumTerm, (1, 10), 2, 30),
        summary("t0-p5", SummaryTier::ShortTerm, (11, 20), 5, 5),
        summary("t0-newest", SummaryTier::ShortTerm, (21, 30), 1, 1),
    ];
    assert_eq!(plan_eviction(&summaries, 200), vec!["t1-p2"]);
    assert_eq!(plan_eviction(&summaries, 100), vec!["t1-p2", "t0-p5"]);
    // The newest short-term summary survives even an impossible budget
    assert_eq!(plan_eviction(&summaries, 0), vec!["t1-p2", "t0-p5"]);
    assert!(plan_eviction(&summaries, 300).is_empty());
}

#[test]
fn test_eviction_breaks_priority_ties_by_last_access() {
    let summaries = vec![
        summary("recent", SummaryTier::MediumTerm, (1, 10), 3, 50),
        summary("stale", SummaryTier::MediumTerm, (11, 20), 3, 10),
        summary("newest", SummaryTier::ShortTerm, (21, 30), 1, 0),
    ];
    assert_eq!(plan_eviction(&summaries, 200), vec!["stale"]);
}

#[tokio::test]
async fn test_retention_deletes_rows_and_vectors() {
    let h = Harness::new(SummarizationConfig {
        threshold: 2,
        ..Default::default()
    });
    let conversation = h.memory.create_conversation(Some("u1"), None).unwrap();
    fill(&h, &conversation.id, 6).await;
    assert_eq!(h.index.len().await.unwrap(), 3);

    let summaries = h.db.summaries.get_all_summaries(&conversation.id).unwrap();
    h.memory.set_priority(&summaries[0].id, 9).unwrap();

    let evicted = h.memory.enforce_retention(&conversation.id, 0).await.unwrap();
    assert_eq!(evicted, vec![summaries[1].id.clone(), summaries[0].id.clone()]);
    assert_eq!(h.index.len().await.unwrap(), 1);

    let remaining = h.db.summaries.get_all_summaries(&conversation.id).unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].end_seq, 6);
}

// =============================================================================
// RETRIEVAL AND BACKFILL
// =============================================================================

#[tokio::test]
async fn test_relevant_memory_is_whole_and_touched() {
    let h = Harness::new(SummarizationConfig {
        threshold: 2,
        recent_message_count: 0,
        ..Default::default()
    });
    let conversation = h.memory.create_conversation(Some("u1"), None).unwrap();
    h.memory
        .append_message_at(&conversation.id, Role::User, "We planted roses along the fence.", at(1, 0))
        .await
        .unwrap();
    h.memory
        .append_message_at(&conversation.id, Role::Assistant, "Roses need full sun.", at(2, 0))
        .await
        .unwrap();
    h.memory
        .append_message_at(&conversation.id, Role::User, "My car needs new tyres.", at(3, 0))
        .await
        .unwrap();
    h.memory
        .append_message_at(&conversation.id, Role::Assistant, "Check the tyre pressure first.", at(4, 0))
        .await
        .unwrap();

    let now = at(30, 0);
    let memory = h
        .memory
        .retrieve_relevant_memory("how are the roses doing", &conversation.id, 10_000, now)
        .await
        .unwrap();
    assert_eq!(memory.summaries.len(), 2);
    assert_eq!(memory.summaries[0].summary.start_seq, 1);
    assert!(memory.summaries[0].score > memory.summaries[1].score);

    let first_len = memory.summaries[0].summary.content.chars().count();
    let tight = h
        .memory
        .retrieve_relevant_memory("how are the roses doing", &conversation.id, first_len, now)
        .await
        .unwrap();
    assert_eq!(tight.summaries.len(), 1);
    assert_eq!(tight.used_chars, first_len);

    let stored = h.db.summaries.get_summary(&memory.summaries[0].summary.id).unwrap().unwrap();
    assert_eq!(stored.last_accessed, now);
}

#[tokio::test]
async fn test_backfill_after_index_outage() {
    let h = Harness::new(SummarizationConfig {
        threshold: 2,
        ..Default::default()
    });
    let conversation = h.memory.create_conversation(Some("u1"), None).unwrap();

    ControlledIndex::set(&h.index.fail_upserts, true);
    fill(&h, &conversation.id, 2).await;
    let summaries = h.db.summaries.get_all_summaries(&conversation.id).unwrap();
    assert_eq!(summaries.len(), 1);
    assert!(summaries[0].embedding_ref.is_none());

    ControlledIndex::set(&h.index.fail_upserts, false);
    assert_eq!(h.memory.backfill_embeddings(10).await.unwrap(), 1);
    assert_eq!(h.index.len().await.unwrap(), 1);
    assert_eq!(h.memory.backfill_embeddings(10).await.unwrap(), 0);
}
