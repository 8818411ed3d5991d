//! Prometheus collectors for cache, provider, retrieval and tracking activity
//!
//! Collectors are created once by `init_metrics`; every recording helper is a
//! no-op until then, so library users who never call it pay nothing.
use lazy_static::lazy_static;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Registry, TextEncoder};
use std::sync::OnceLock;

lazy_static! {
    static ref REGISTRY: Registry = Registry::new();
}

static CACHE_LOOKUPS: OnceLock<IntCounterVec> = OnceLock::new();
static PROVIDER_CALLS: OnceLock<IntCounterVec> = OnceLock::new();
static CIRCUIT_TRANSITIONS: OnceLock<IntCounterVec> = OnceLock::new();
static RETRIEVAL_LATENCY: OnceLock<Histogram> = OnceLock::new();
static RETRIEVAL_DEGRADED: OnceLock<IntCounterVec> = OnceLock::new();
static SUMMARIES_CREATED: OnceLock<IntCounterVec> = OnceLock::new();
static TRACKING_FAILURES: OnceLock<IntCounter> = OnceLock::new();
static RECONCILIATION_QUEUED: OnceLock<IntCounter> = OnceLock::new();

pub fn init_metrics() {
    let cache_lookups = CACHE_LOOKUPS.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("embedding_cache_lookups_total", "Embedding cache lookups by outcome"),
            &["outcome"],
        )
        .unwrap()
    });

    let provider_calls = PROVIDER_CALLS.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("provider_calls_total", "External provider calls by provider and outcome"),
            &["provider", "outcome"],
        )
        .unwrap()
    });

    let circuit_transitions = CIRCUIT_TRANSITIONS.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("circuit_breaker_transitions_total", "Circuit breaker state changes"),
            &["provider", "state"],
        )
        .unwrap()
    });

    let retrieval_latency = RETRIEVAL_LATENCY.get_or_init(|| {
        Histogram::with_opts(
            HistogramOpts::new("retrieval_latency_seconds", "End-to-end retrieval latency")
                .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0]),
        )
        .unwrap()
    });

    let retrieval_degraded = RETRIEVAL_DEGRADED.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("retrieval_degraded_total", "Retrievals served without one of their sources"),
            &["source"],
        )
        .unwrap()
    });

    let summaries_created = SUMMARIES_CREATED.get_or_init(|| {
        IntCounterVec::new(
            prometheus::opts!("conversation_summaries_created_total", "Summaries written per tier"),
            &["tier"],
        )
        .unwrap()
    });

    let tracking_failures = TRACKING_FAILURES.get_or_init(|| {
        IntCounter::new("operation_tracking_failures_total", "Operation records that failed to persist")
            .unwrap()
    });

    let reconciliation_queued = RECONCILIATION_QUEUED.get_or_init(|| {
        IntCounter::new(
            "vector_reconciliation_queued_total",
            "Vector deletions deferred to reconciliation",
        )
        .unwrap()
    });

    REGISTRY.register(Box::new(cache_lookups.clone())).ok();
    REGISTRY.register(Box::new(provider_calls.clone())).ok();
    REGISTRY.register(Box::new(circuit_transitions.clone())).ok();
    REGISTRY.register(Box::new(retrieval_latency.clone())).ok();
    REGISTRY.register(Box::new(retrieval_degraded.clone())).ok();
    REGISTRY.register(Box::new(summaries_created.clone())).ok();
    REGISTRY.register(Box::new(tracking_failures.clone())).ok();
    REGISTRY.register(Box::new(reconciliation_queued.clone())).ok();
}

pub fn inc_cache_lookup(hit: bool) {
    if let Some(counter) = CACHE_LOOKUPS.get() {
        counter.with_label_values(&[if hit { "hit" } else { "miss" }]).inc();
    }
}

pub fn inc_provider_call(provider: &str, outcome: &str) {
    if let Some(counter) = PROVIDER_CALLS.get() {
        counter.with_label_values(&[provider, outcome]).inc();
    }
}

pub fn inc_circuit_transition(provider: &str, state: &str) {
    if let Some(counter) = CIRCUIT_TRANSITIONS.get() {
        counter.with_label_values(&[provider, state]).inc();
    }
}

pub fn observe_retrieval_latency(seconds: f64) {
    if let Some(histogram) = RETRIEVAL_LATENCY.get() {
        histogram.observe(seconds);
    }
}

pub fn inc_retrieval_degraded(source: &str) {
    if let Some(counter) = RETRIEVAL_DEGRADED.get() {
        counter.with_label_values(&[source]).inc();
    }
}

pub fn inc_summaries_created(tier: &str) {
    if let Some(counter) = SUMMARIES_CREATED.get() {
        counter.with_label_values(&[tier]).inc();
    }
}

pub fn inc_tracking_failure() {
    if let Some(counter) = TRACKING_FAILURES.get() {
        counter.inc();
    }
}

pub fn inc_reconciliation_queued(count: u64) {
    if let Some(counter) = RECONCILIATION_QUEUED.get() {
        counter.inc_by(count);
    }
}

/// Render every registered collector in the Prometheus text format
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}
