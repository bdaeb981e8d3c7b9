//! Provider-fallback dispatcher with ranked routing and health probes.
//!
//! Given a request, [`FallbackDispatcher`] tries registered providers in
//! ranked order until one answers. Ranking is recomputed at registration,
//! on explicit re-sort requests, and between retry rounds:
//!
//! 1. descending `priority`;
//! 2. descending success rate (`successes / (successes + failures)`,
//!    undefined treated as 1);
//! 3. descending `weight`.
//!
//! Rounds are separated by an exponential delay (`base * 2^round`, with
//! full jitter). A background task can probe every provider on an
//! interval and feed the health monitor.

use crate::error::{ProcessorError, Result};
use crate::events::{emit, Event, EventHandler};
use crate::health::{HealthMonitor, ServiceStatus};
use crate::provider::{LlmRequest, LlmResponse, ProviderClient};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A registered provider: identity, ranking inputs, and its client.
///
/// Immutable after registration; removal is explicit via
/// [`FallbackDispatcher::remove`].
#[derive(Clone)]
pub struct ProviderDescriptor {
    /// Unique provider name.
    pub name: String,
    /// Primary ranking key; higher tries first.
    pub priority: i32,
    /// Tie-break ranking key; higher tries first.
    pub weight: f64,
    /// Per-attempt timeout ceiling for this provider.
    pub max_timeout: Duration,
    /// The client used to reach the endpoint.
    pub client: Arc<dyn ProviderClient>,
}

impl std::fmt::Debug for ProviderDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderDescriptor")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("weight", &self.weight)
            .field("max_timeout", &self.max_timeout)
            .finish()
    }
}

/// Rolling outcome counters for one provider.
///
/// Counters are monotone; `avg_response_ms` is a running mean over
/// successes only.
#[derive(Debug, Clone, Default)]
pub struct ProviderStats {
    /// Successful calls.
    pub successes: u64,
    /// Failed calls (timeouts and errors).
    pub failures: u64,
    /// Running mean latency of successful calls, in milliseconds.
    pub avg_response_ms: f64,
    /// Wall-clock time of the last success.
    pub last_success: Option<DateTime<Utc>>,
}

impl ProviderStats {
    /// `successes / (successes + failures)`, or `None` with no data.
    pub fn success_rate(&self) -> Option<f64> {
        let total = self.successes + self.failures;
        if total == 0 {
            None
        } else {
            Some(self.successes as f64 / total as f64)
        }
    }

    fn record_success(&mut self, latency_ms: u64) {
        self.successes += 1;
        let n = self.successes as f64;
        self.avg_response_ms += (latency_ms as f64 - self.avg_response_ms) / n;
        self.last_success = Some(Utc::now());
    }

    fn record_failure(&mut self) {
        self.failures += 1;
    }
}

/// Dispatcher tunables.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Number of full provider rounds before giving up.
    pub max_retries: u32,
    /// Overall deadline applied when the caller does not pass one.
    pub default_deadline: Duration,
    /// Base for the inter-round delay (`base * 2^round`, jittered).
    pub round_delay_base: Duration,
    /// Interval of the background health probe task.
    pub health_check_interval: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            default_deadline: Duration::from_secs(30),
            round_delay_base: Duration::from_secs(1),
            health_check_interval: Duration::from_secs(60),
        }
    }
}

/// Ranked multi-provider dispatcher (C2).
pub struct FallbackDispatcher {
    /// Providers in current rank order.
    providers: RwLock<Vec<ProviderDescriptor>>,
    stats: DashMap<String, ProviderStats>,
    config: DispatcherConfig,
    events: Option<Arc<dyn EventHandler>>,
    shutdown: Arc<AtomicBool>,
}

impl FallbackDispatcher {
    /// Create an empty dispatcher.
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            providers: RwLock::new(Vec::new()),
            stats: DashMap::new(),
            config,
            events: None,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Attach an event sink for `QuerySuccess`/`QueryError`.
    pub fn with_events(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = Some(events);
        self
    }

    /// Register a provider. A duplicate name replaces the old entry.
    pub fn register(&self, descriptor: ProviderDescriptor) {
        let mut providers = self.providers.write();
        providers.retain(|p| p.name != descriptor.name);
        self.stats
            .entry(descriptor.name.clone())
            .or_insert_with(ProviderStats::default);
        providers.push(descriptor);
        let ranked = self.ranked(&providers);
        *providers = ranked;
    }

    /// Remove a provider by name. Its stats are retained.
    pub fn remove(&self, name: &str) -> bool {
        let mut providers = self.providers.write();
        let before = providers.len();
        providers.retain(|p| p.name != name);
        providers.len() != before
    }

    /// Recompute the rank order from current stats.
    pub fn resort(&self) {
        let mut providers = self.providers.write();
        let ranked = self.ranked(&providers);
        *providers = ranked;
    }

    /// Current rank order, by name.
    pub fn ranked_names(&self) -> Vec<String> {
        self.providers.read().iter().map(|p| p.name.clone()).collect()
    }

    /// Snapshot of one provider's stats.
    pub fn stats(&self, name: &str) -> Option<ProviderStats> {
        self.stats.get(name).map(|s| s.clone())
    }

    /// Number of registered providers.
    pub fn provider_count(&self) -> usize {
        self.providers.read().len()
    }

    /// Stable rank: priority desc, success rate desc (unknown = 1), weight desc.
    fn ranked(&self, providers: &[ProviderDescriptor]) -> Vec<ProviderDescriptor> {
        let mut out = providers.to_vec();
        out.sort_by(|a, b| {
            b.priority.cmp(&a.priority).then_with(|| {
                let ra = self.rate_or_one(&a.name);
                let rb = self.rate_or_one(&b.name);
                rb.partial_cmp(&ra)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| {
                        b.weight
                            .partial_cmp(&a.weight)
                            .unwrap_or(std::cmp::Ordering::Equal)
                    })
            })
        });
        out
    }

    fn rate_or_one(&self, name: &str) -> f64 {
        self.stats
            .get(name)
            .and_then(|s| s.success_rate())
            .unwrap_or(1.0)
    }

    /// Dispatch with the configured default deadline.
    pub async fn dispatch(&self, request: &LlmRequest) -> Result<LlmResponse> {
        self.dispatch_with_deadline(request, self.config.default_deadline)
            .await
    }

    /// Dispatch a request, trying providers in ranked order across up to
    /// `max_retries` rounds, within an overall `deadline`.
    ///
    /// Per attempt, the provider call races a timer of
    /// `min(provider.max_timeout, remaining_deadline)`. Retryable
    /// failures advance to the next provider; if a whole round yields
    /// only non-retryable failures there is nothing left to retry and the
    /// dispatcher fails fast.
    pub async fn dispatch_with_deadline(
        &self,
        request: &LlmRequest,
        deadline: Duration,
    ) -> Result<LlmResponse> {
        request.validate()?;
        let started = Instant::now();
        let provider_count = self.provider_count();
        if provider_count == 0 {
            return Err(ProcessorError::Other("no providers registered".into()));
        }

        let mut attempts = 0u32;
        let mut last_error: Option<ProcessorError> = None;

        for round in 0..self.config.max_retries {
            if self.shutdown.load(Ordering::Relaxed) {
                return Err(ProcessorError::Cancelled);
            }
            let round_providers = self.providers.read().clone();
            let mut any_retryable = false;

            for provider in &round_providers {
                let remaining = deadline.saturating_sub(started.elapsed());
                if remaining.is_zero() {
                    return Err(last_error.unwrap_or(ProcessorError::Timeout(deadline)));
                }
                let attempt_timeout = provider.max_timeout.min(remaining);

                attempts += 1;
                let outcome =
                    tokio::time::timeout(attempt_timeout, provider.client.query(request)).await;

                match outcome {
                    Ok(Ok(response)) => {
                        if let Some(mut s) = self.stats.get_mut(&provider.name) {
                            s.record_success(response.latency_ms);
                        }
                        emit(
                            &self.events,
                            Event::QuerySuccess {
                                provider: provider.name.clone(),
                                latency_ms: response.latency_ms,
                                tokens: response.usage.total,
                            },
                        );
                        return Ok(response);
                    }
                    Ok(Err(e)) => {
                        let retryable = e.is_retryable();
                        any_retryable |= retryable;
                        if let Some(mut s) = self.stats.get_mut(&provider.name) {
                            s.record_failure();
                        }
                        emit(
                            &self.events,
                            Event::QueryError {
                                provider: provider.name.clone(),
                                class: e.class(),
                                retryable,
                            },
                        );
                        tracing::debug!(
                            provider = %provider.name,
                            class = e.class(),
                            retryable,
                            "provider attempt failed"
                        );
                        last_error = Some(e);
                    }
                    Err(_elapsed) => {
                        any_retryable = true;
                        if let Some(mut s) = self.stats.get_mut(&provider.name) {
                            s.record_failure();
                        }
                        emit(
                            &self.events,
                            Event::QueryError {
                                provider: provider.name.clone(),
                                class: "timeout",
                                retryable: true,
                            },
                        );
                        last_error = Some(ProcessorError::Timeout(attempt_timeout));
                    }
                }
            }

            // All providers rejecting authoritatively: retrying cannot help.
            if !any_retryable {
                break;
            }

            if round + 1 < self.config.max_retries {
                let base = self.config.round_delay_base.as_secs_f64() * 2f64.powi(round as i32);
                let jittered = Duration::from_secs_f64(fastrand::f64() * base);
                tokio::time::sleep(jittered).await;
                self.resort();
            }
        }

        // Credential failure across the board surfaces as Auth.
        if let Some(ProcessorError::Auth { provider }) = &last_error {
            return Err(ProcessorError::Auth {
                provider: provider.clone(),
            });
        }

        Err(ProcessorError::AllProvidersFailed {
            providers: provider_count,
            attempts,
            last: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no error recorded".into()),
        })
    }

    /// Spawn the background health-probe loop.
    ///
    /// Every `health_check_interval`, each provider is probed and the
    /// health monitor's status for it is updated. Returns the task
    /// handle; the loop exits when [`shutdown`](Self::shutdown) is called.
    pub fn spawn_health_task(
        self: Arc<Self>,
        health: Arc<HealthMonitor>,
    ) -> tokio::task::JoinHandle<()> {
        let dispatcher = self;
        let shutdown = Arc::clone(&dispatcher.shutdown);
        tokio::spawn(async move {
            let interval = dispatcher.config.health_check_interval;
            loop {
                tokio::time::sleep(interval).await;
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let providers = dispatcher.providers.read().clone();
                for provider in providers {
                    let status = match provider.client.probe().await {
                        Ok(()) => ServiceStatus::Up,
                        Err(e) if e.is_retryable() => ServiceStatus::Degraded,
                        Err(_) => ServiceStatus::Down,
                    };
                    health.set_status(&provider.name, status);
                }
            }
        })
    }

    /// Signal background tasks to stop and fail new dispatches.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{MockOutcome, MockProvider};

    fn descriptor(
        name: &str,
        priority: i32,
        weight: f64,
        client: Arc<dyn ProviderClient>,
    ) -> ProviderDescriptor {
        ProviderDescriptor {
            name: name.into(),
            priority,
            weight,
            max_timeout: Duration::from_millis(50),
            client,
        }
    }

    fn fast_config() -> DispatcherConfig {
        DispatcherConfig {
            max_retries: 3,
            default_deadline: Duration::from_millis(500),
            round_delay_base: Duration::from_millis(1),
            health_check_interval: Duration::from_secs(60),
        }
    }

    fn request() -> LlmRequest {
        LlmRequest::prompt("test-model", "hello")
    }

    #[test]
    fn test_ranking_priority_then_rate_then_weight() {
        let d = FallbackDispatcher::new(fast_config());
        d.register(descriptor("low", 1, 0.9, Arc::new(MockProvider::fixed("x"))));
        d.register(descriptor("high", 2, 0.1, Arc::new(MockProvider::fixed("x"))));
        d.register(descriptor("mid", 1, 1.0, Arc::new(MockProvider::fixed("x"))));
        // Same priority: unknown rates tie at 1.0, weight decides.
        assert_eq!(d.ranked_names(), ["high", "mid", "low"]);
    }

    #[test]
    fn test_ranking_stable_under_unchanged_stats() {
        let d = FallbackDispatcher::new(fast_config());
        for name in ["a", "b", "c"] {
            d.register(descriptor(name, 1, 0.5, Arc::new(MockProvider::fixed("x"))));
        }
        let first = d.ranked_names();
        d.resort();
        d.resort();
        assert_eq!(d.ranked_names(), first);
    }

    #[test]
    fn test_success_rate_reorders() {
        let d = FallbackDispatcher::new(fast_config());
        d.register(descriptor("a", 1, 0.5, Arc::new(MockProvider::fixed("x"))));
        d.register(descriptor("b", 1, 0.5, Arc::new(MockProvider::fixed("x"))));
        d.stats.get_mut("a").unwrap().record_failure();
        d.stats.get_mut("b").unwrap().record_success(10);
        d.resort();
        assert_eq!(d.ranked_names(), ["b", "a"]);
    }

    #[tokio::test]
    async fn test_fallback_across_providers() {
        // S2: A (priority 2) always times out, B (priority 1) answers.
        let a = Arc::new(MockProvider::always_timing_out().named("A"));
        let b = Arc::new(MockProvider::fixed("ok").named("B"));
        let d = FallbackDispatcher::new(fast_config());
        d.register(descriptor("A", 2, 1.0, a));
        d.register(descriptor("B", 1, 1.0, b));

        let started = Instant::now();
        let resp = d
            .dispatch_with_deadline(&request(), Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(resp.text, "ok");
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(d.stats("A").unwrap().failures, 1);
        assert_eq!(d.stats("B").unwrap().successes, 1);
    }

    #[tokio::test]
    async fn test_all_fail_attempt_count() {
        let d = FallbackDispatcher::new(fast_config());
        d.register(descriptor(
            "a",
            2,
            1.0,
            Arc::new(MockProvider::new("a", vec![MockOutcome::Http(503)])),
        ));
        d.register(descriptor(
            "b",
            1,
            1.0,
            Arc::new(MockProvider::new("b", vec![MockOutcome::Http(500)])),
        ));

        let err = d
            .dispatch_with_deadline(&request(), Duration::from_secs(5))
            .await
            .unwrap_err();
        match err {
            ProcessorError::AllProvidersFailed {
                providers,
                attempts,
                ..
            } => {
                assert_eq!(providers, 2);
                // max_retries rounds x provider count
                assert_eq!(attempts, 6);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_all_auth_fails_fast() {
        let d = FallbackDispatcher::new(fast_config());
        d.register(descriptor(
            "a",
            1,
            1.0,
            Arc::new(MockProvider::always_unauthorized().named("a")),
        ));
        d.register(descriptor(
            "b",
            0,
            1.0,
            Arc::new(MockProvider::always_unauthorized().named("b")),
        ));

        let err = d
            .dispatch_with_deadline(&request(), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessorError::Auth { .. }));
        // Single round only: nothing was retryable.
        assert_eq!(d.stats("a").unwrap().failures, 1);
        assert_eq!(d.stats("b").unwrap().failures, 1);
    }

    #[tokio::test]
    async fn test_stats_running_mean() {
        let mut stats = ProviderStats::default();
        stats.record_success(100);
        stats.record_success(200);
        assert_eq!(stats.successes, 2);
        assert!((stats.avg_response_ms - 150.0).abs() < 1e-9);
        assert!(stats.last_success.is_some());
    }

    #[tokio::test]
    async fn test_duplicate_registration_replaces() {
        let d = FallbackDispatcher::new(fast_config());
        d.register(descriptor("a", 1, 1.0, Arc::new(MockProvider::fixed("old"))));
        d.register(descriptor("a", 5, 1.0, Arc::new(MockProvider::fixed("new"))));
        assert_eq!(d.provider_count(), 1);
        let resp = d.dispatch(&request()).await.unwrap();
        assert_eq!(resp.text, "new");
    }

    #[tokio::test]
    async fn test_empty_problem_never_reaches_provider() {
        let mock = Arc::new(MockProvider::fixed("x"));
        let d = FallbackDispatcher::new(fast_config());
        d.register(descriptor("a", 1, 1.0, Arc::clone(&mock) as Arc<dyn ProviderClient>));
        let err = d.dispatch(&LlmRequest::prompt("m", "")).await.unwrap_err();
        assert!(matches!(err, ProcessorError::InvalidInput { .. }));
        assert_eq!(mock.call_count(), 0);
    }
}
