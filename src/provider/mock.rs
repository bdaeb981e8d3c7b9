//! Mock provider for testing without a live LLM.
//!
//! [`MockProvider`] returns scripted outcomes in order, allowing
//! deterministic tests of the dispatcher, thinking engine, and pipeline.
//!
//! # Example
//!
//! ```
//! use cognitive_processor::provider::MockProvider;
//!
//! let mock = MockProvider::fixed("ok");
//! let failing = MockProvider::always_timing_out();
//! ```

use super::{new_instance_id, LlmRequest, LlmResponse, ProviderClient, TokenUsage};
use crate::error::{ProcessorError, Result};
use crate::tokens::estimate_tokens;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// One scripted outcome for a mock call.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// Succeed with this text.
    Text(String),
    /// Fail with a timeout error.
    Timeout,
    /// Fail with a rate-limit error.
    RateLimited,
    /// Fail with an auth error.
    Auth,
    /// Fail with this HTTP status.
    Http(u16),
}

/// Start/end instants of one observed call, for ordering assertions.
#[derive(Debug, Clone, Copy)]
pub struct CallSpan {
    /// When the call began.
    pub started: Instant,
    /// When the call returned.
    pub finished: Instant,
}

/// A test provider that replays scripted outcomes in order.
///
/// Cycles back to the beginning when all outcomes have been consumed.
/// Records a [`CallSpan`] per call so tests can assert on ordering
/// and isolation.
pub struct MockProvider {
    name: String,
    instance_id: String,
    script: Vec<MockOutcome>,
    index: AtomicUsize,
    delay: Duration,
    spans: Mutex<Vec<CallSpan>>,
}

impl std::fmt::Debug for MockProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockProvider")
            .field("name", &self.name)
            .field("script_len", &self.script.len())
            .field("calls", &self.call_count())
            .finish()
    }
}

impl MockProvider {
    /// Create a mock replaying the given outcomes in order.
    pub fn new(name: impl Into<String>, script: Vec<MockOutcome>) -> Self {
        assert!(
            !script.is_empty(),
            "MockProvider requires at least one outcome"
        );
        let name = name.into();
        let instance_id = new_instance_id(&name);
        Self {
            name,
            instance_id,
            script,
            index: AtomicUsize::new(0),
            delay: Duration::ZERO,
            spans: Mutex::new(Vec::new()),
        }
    }

    /// A mock that always returns the same text.
    pub fn fixed(text: impl Into<String>) -> Self {
        Self::new("mock", vec![MockOutcome::Text(text.into())])
    }

    /// A mock that replays the given texts in order, cycling.
    pub fn replies(texts: Vec<String>) -> Self {
        Self::new("mock", texts.into_iter().map(MockOutcome::Text).collect())
    }

    /// A mock whose every call fails with a timeout.
    pub fn always_timing_out() -> Self {
        Self::new("mock-timeout", vec![MockOutcome::Timeout])
    }

    /// A mock whose every call fails with an auth error.
    pub fn always_unauthorized() -> Self {
        Self::new("mock-auth", vec![MockOutcome::Auth])
    }

    /// Override the provider name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self.instance_id = new_instance_id(&self.name);
        self
    }

    /// Sleep this long inside each call before resolving.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of calls observed so far.
    pub fn call_count(&self) -> usize {
        self.spans.lock().len()
    }

    /// Snapshot of recorded call spans.
    pub fn call_spans(&self) -> Vec<CallSpan> {
        self.spans.lock().clone()
    }

    fn next_outcome(&self) -> MockOutcome {
        let idx = self.index.fetch_add(1, Ordering::Relaxed) % self.script.len();
        self.script[idx].clone()
    }
}

#[async_trait]
impl ProviderClient for MockProvider {
    async fn query(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let started = Instant::now();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let outcome = self.next_outcome();
        let result = match outcome {
            MockOutcome::Text(text) => Ok(LlmResponse {
                usage: TokenUsage::new(
                    estimate_tokens(&request.flattened_text()),
                    estimate_tokens(&text),
                ),
                text,
                model: request.model.clone(),
                latency_ms: started.elapsed().as_millis() as u64,
            }),
            MockOutcome::Timeout => Err(ProcessorError::Timeout(Duration::from_millis(50))),
            MockOutcome::RateLimited => Err(ProcessorError::RateLimited {
                provider: self.name.clone(),
                retry_after: None,
            }),
            MockOutcome::Auth => Err(ProcessorError::Auth {
                provider: self.name.clone(),
            }),
            MockOutcome::Http(status) => Err(ProcessorError::Http {
                status,
                body: String::new(),
            }),
        };
        self.spans.lock().push(CallSpan {
            started,
            finished: Instant::now(),
        });
        result
    }

    async fn probe(&self) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn instance_id(&self) -> &str {
        &self.instance_id
    }
}
