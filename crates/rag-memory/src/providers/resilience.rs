//! Retry with backoff and a circuit breaker around embedding calls
//!
//! # States
//! - **Closed**: calls pass through
//! - **Open**: calls fail fast until `open_duration` has elapsed
//! - **HalfOpen**: calls pass; `success_threshold` successes close the
//!   circuit, a single failure reopens it

use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::{is_retryable, EmbeddingProvider};
use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Consecutive successes needed to close from half-open
    pub success_threshold: u32,
    pub open_duration: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_duration: Duration::from_secs(30),
        }
    }
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_state_change: Instant,
}

pub struct CircuitBreaker {
    name: &'static str,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: CircuitBreakerConfig, now: Instant) -> Self {
        Self {
            name,
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_state_change: now,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    fn transition(&self, state: &mut BreakerState, to: CircuitState, now: Instant) {
        state.state = to;
        state.last_state_change = now;
        metrics::inc_circuit_transition(self.name, &to.to_string());
    }

    /// Whether a call may go out at `now`; moves Open to HalfOpen once the cooldown passed
    pub fn allow(&self, now: Instant) -> bool {
        let mut state = self.lock();
        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                if now.saturating_duration_since(state.last_state_change) >= self.config.open_duration {
                    info!("{} circuit breaker transitioning from Open to HalfOpen", self.name);
                    state.consecutive_successes = 0;
                    self.transition(&mut state, CircuitState::HalfOpen, now);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&self, now: Instant) {
        let mut state = self.lock();
        state.consecutive_failures = 0;
        state.consecutive_successes += 1;
        if state.state == CircuitState::HalfOpen
            && state.consecutive_successes >= self.config.success_threshold
        {
            info!(
                "{} circuit breaker closing after {} consecutive successes",
                self.name, state.consecutive_successes
            );
            self.transition(&mut state, CircuitState::Closed, now);
        }
    }

    pub fn record_failure(&self, now: Instant) {
        let mut state = self.lock();
        state.consecutive_successes = 0;
        state.consecutive_failures += 1;
        match state.state {
            CircuitState::Closed if state.consecutive_failures >= self.config.failure_threshold => {
                warn!(
                    "{} circuit breaker opening after {} consecutive failures",
                    self.name, state.consecutive_failures
                );
                self.transition(&mut state, CircuitState::Open, now);
            }
            CircuitState::HalfOpen => {
                warn!("{} circuit breaker returning to Open after failure in HalfOpen", self.name);
                self.transition(&mut state, CircuitState::Open, now);
            }
            _ => {}
        }
    }
}

/// Exponential backoff with jitter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`
    /// capped at `max_delay`, plus up to 50% random jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let raw = self.base_delay.saturating_mul(1u32 << exp).min(self.max_delay);
        let jitter_ms = raw.as_millis() as u64 / 2;
        let jitter = if jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=jitter_ms)
        } else {
            0
        };
        raw + Duration::from_millis(jitter)
    }
}

/// Embedding provider wrapper adding per-call timeout, retries and a circuit breaker
pub struct ResilientEmbeddingProvider {
    inner: Arc<dyn EmbeddingProvider>,
    retry: RetryPolicy,
    call_timeout: Duration,
    breaker: CircuitBreaker,
    total_calls: AtomicU64,
    total_rejections: AtomicU64,
}

impl ResilientEmbeddingProvider {
    pub fn new(
        inner: Arc<dyn EmbeddingProvider>,
        retry: RetryPolicy,
        breaker: CircuitBreakerConfig,
        call_timeout: Duration,
    ) -> Self {
        Self {
            inner,
            retry,
            call_timeout,
            breaker: CircuitBreaker::new("embedding", breaker, Instant::now()),
            total_calls: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::Relaxed)
    }

    pub fn total_rejections(&self) -> u64 {
        self.total_rejections.load(Ordering::Relaxed)
    }

    async fn attempt(&self, text: &str, model_id: &str) -> anyhow::Result<Vec<f32>> {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        match tokio::time::timeout(self.call_timeout, self.inner.embed(text, model_id)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("embedding call timed out after {:?}", self.call_timeout)),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for ResilientEmbeddingProvider {
    async fn embed(&self, text: &str, model_id: &str) -> anyhow::Result<Vec<f32>> {
        let mut attempt = 0;
        loop {
            if !self.breaker.allow(Instant::now()) {
                self.total_rejections.fetch_add(1, Ordering::Relaxed);
                metrics::inc_provider_call(self.inner.name(), "rejected");
                anyhow::bail!("embedding circuit breaker is open");
            }

            match self.attempt(text, model_id).await {
                Ok(vector) => {
                    self.breaker.record_success(Instant::now());
                    metrics::inc_provider_call(self.inner.name(), "success");
                    return Ok(vector);
                }
                Err(e) => {
                    self.breaker.record_failure(Instant::now());
                    metrics::inc_provider_call(self.inner.name(), "failure");
                    attempt += 1;
                    if attempt > self.retry.max_retries || !is_retryable(&e) {
                        warn!("Embedding failed after {} attempt(s): {}", attempt, e);
                        return Err(e);
                    }
                    let delay = self.retry.delay_for(attempt);
                    debug!("Embedding attempt {} failed ({}), retrying in {:?}", attempt, e, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}
