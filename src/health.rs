//! Per-service health status and rolling metrics aggregation.
//!
//! [`HealthMonitor`] tracks a status per service plus rolling request,
//! latency, error, token, and cache-hit metrics. It implements
//! [`EventHandler`] so it can be wired directly as the dispatcher's event
//! sink: query outcomes flow in as events, no explicit calls needed.

use crate::events::{emit, Event, EventHandler};
use crate::ProcessorError;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Health of one service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// Responding normally.
    Up,
    /// Responding with elevated errors or latency.
    Degraded,
    /// Not responding.
    Down,
}

impl ServiceStatus {
    /// Stable wire string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Up => "up",
            ServiceStatus::Degraded => "degraded",
            ServiceStatus::Down => "down",
        }
    }
}

/// Aggregate across all services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    /// Every service is up.
    Healthy,
    /// At least one service is degraded, none down.
    Degraded,
    /// At least one service is down.
    Unhealthy,
}

/// Rolling counters for one service.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServiceMetrics {
    /// Requests observed.
    pub requests: u64,
    /// Failed requests.
    pub errors: u64,
    /// Sum of latencies of successful requests, for the mean.
    total_latency_ms: u64,
    /// Successful requests, denominator for the latency mean.
    latency_samples: u64,
    /// Total tokens consumed.
    pub tokens: u64,
}

impl ServiceMetrics {
    /// Mean latency over successful requests, in milliseconds.
    pub fn avg_latency_ms(&self) -> f64 {
        if self.latency_samples == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / self.latency_samples as f64
        }
    }

    /// Errors over requests, in `[0,1]`.
    pub fn error_rate(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.errors as f64 / self.requests as f64
        }
    }
}

/// Serializable snapshot for resources and the persisted metrics file.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// Aggregate status.
    pub overall: OverallStatus,
    /// Status per service.
    pub services: HashMap<String, ServiceStatus>,
    /// Total requests across services.
    pub requests: u64,
    /// Mean latency across services, in milliseconds.
    pub avg_latency_ms: f64,
    /// Error rate across services.
    pub error_rate: f64,
    /// Total tokens across services.
    pub tokens: u64,
    /// Cache hit rate in `[0,1]`.
    pub cache_hit_rate: f64,
}

/// Health monitor (C9).
pub struct HealthMonitor {
    statuses: RwLock<HashMap<String, ServiceStatus>>,
    metrics: RwLock<HashMap<String, ServiceMetrics>>,
    cache_hits: RwLock<(u64, u64)>,
    events: Option<Arc<dyn EventHandler>>,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthMonitor {
    /// Create a monitor with no observed services.
    pub fn new() -> Self {
        Self {
            statuses: RwLock::new(HashMap::new()),
            metrics: RwLock::new(HashMap::new()),
            cache_hits: RwLock::new((0, 0)),
            events: None,
        }
    }

    /// Attach an event sink for `HealthUpdate`/`MetricsUpdate`.
    pub fn with_events(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = Some(events);
        self
    }

    /// Set a service's status, emitting `HealthUpdate` on change.
    pub fn set_status(&self, service: &str, status: ServiceStatus) {
        let changed = {
            let mut statuses = self.statuses.write();
            statuses.insert(service.to_string(), status) != Some(status)
        };
        if changed {
            tracing::info!(service, status = status.as_str(), "service status changed");
            emit(
                &self.events,
                Event::HealthUpdate {
                    service: service.to_string(),
                    status: status.as_str(),
                },
            );
        }
    }

    /// Record one request outcome for a service.
    pub fn record_request(&self, service: &str, latency_ms: Option<u64>, tokens: u64, ok: bool) {
        let (requests, error_rate) = {
            let mut metrics = self.metrics.write();
            let m = metrics.entry(service.to_string()).or_default();
            m.requests += 1;
            m.tokens += tokens;
            if let Some(latency) = latency_ms {
                m.total_latency_ms += latency;
                m.latency_samples += 1;
            }
            if !ok {
                m.errors += 1;
            }
            let totals = metrics.values().fold((0u64, 0u64), |(req, err), m| {
                (req + m.requests, err + m.errors)
            });
            (
                totals.0,
                if totals.0 == 0 {
                    0.0
                } else {
                    totals.1 as f64 / totals.0 as f64
                },
            )
        };
        emit(
            &self.events,
            Event::MetricsUpdate {
                requests,
                error_rate,
            },
        );
    }

    /// Record a cache lookup outcome.
    pub fn record_cache(&self, hit: bool) {
        let mut counts = self.cache_hits.write();
        counts.1 += 1;
        if hit {
            counts.0 += 1;
        }
    }

    /// Metrics for one service.
    pub fn metrics(&self, service: &str) -> Option<ServiceMetrics> {
        self.metrics.read().get(service).cloned()
    }

    /// Aggregate status: unhealthy if any down, degraded if any degraded.
    pub fn overall(&self) -> OverallStatus {
        let statuses = self.statuses.read();
        if statuses.values().any(|s| *s == ServiceStatus::Down) {
            OverallStatus::Unhealthy
        } else if statuses.values().any(|s| *s == ServiceStatus::Degraded) {
            OverallStatus::Degraded
        } else {
            OverallStatus::Healthy
        }
    }

    /// Full serializable snapshot.
    pub fn snapshot(&self) -> HealthSnapshot {
        let metrics = self.metrics.read();
        let mut requests = 0u64;
        let mut errors = 0u64;
        let mut latency_sum = 0u64;
        let mut latency_samples = 0u64;
        let mut tokens = 0u64;
        for m in metrics.values() {
            requests += m.requests;
            errors += m.errors;
            latency_sum += m.total_latency_ms;
            latency_samples += m.latency_samples;
            tokens += m.tokens;
        }
        let (hits, lookups) = *self.cache_hits.read();
        HealthSnapshot {
            overall: self.overall(),
            services: self.statuses.read().clone(),
            requests,
            avg_latency_ms: if latency_samples == 0 {
                0.0
            } else {
                latency_sum as f64 / latency_samples as f64
            },
            error_rate: if requests == 0 {
                0.0
            } else {
                errors as f64 / requests as f64
            },
            tokens,
            cache_hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
        }
    }

    /// Write the snapshot to `metrics/system_metrics.json` under `path`.
    pub fn persist_snapshot(&self, metrics_dir: &Path) -> crate::Result<()> {
        std::fs::create_dir_all(metrics_dir)?;
        let body = serde_json::to_vec_pretty(&self.snapshot())?;
        std::fs::write(metrics_dir.join("system_metrics.json"), body).map_err(|e| {
            ProcessorError::Persistence(format!("system metrics write failed: {}", e))
        })
    }
}

/// Dispatcher events feed the monitor directly.
impl EventHandler for HealthMonitor {
    fn on_event(&self, event: Event) {
        match event {
            Event::QuerySuccess {
                provider,
                latency_ms,
                tokens,
            } => self.record_request(&provider, Some(latency_ms), u64::from(tokens), true),
            Event::QueryError { provider, .. } => self.record_request(&provider, None, 0, false),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overall_aggregation() {
        let monitor = HealthMonitor::new();
        assert_eq!(monitor.overall(), OverallStatus::Healthy);

        monitor.set_status("a", ServiceStatus::Up);
        monitor.set_status("b", ServiceStatus::Up);
        assert_eq!(monitor.overall(), OverallStatus::Healthy);

        monitor.set_status("b", ServiceStatus::Degraded);
        assert_eq!(monitor.overall(), OverallStatus::Degraded);

        monitor.set_status("a", ServiceStatus::Down);
        assert_eq!(monitor.overall(), OverallStatus::Unhealthy);
    }

    #[test]
    fn test_metrics_accumulate() {
        let monitor = HealthMonitor::new();
        monitor.record_request("svc", Some(100), 50, true);
        monitor.record_request("svc", Some(200), 30, true);
        monitor.record_request("svc", None, 0, false);

        let m = monitor.metrics("svc").unwrap();
        assert_eq!(m.requests, 3);
        assert_eq!(m.errors, 1);
        assert_eq!(m.tokens, 80);
        assert!((m.avg_latency_ms() - 150.0).abs() < 1e-9);
        assert!((m.error_rate() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_cache_hit_rate() {
        let monitor = HealthMonitor::new();
        monitor.record_cache(true);
        monitor.record_cache(true);
        monitor.record_cache(false);
        let snap = monitor.snapshot();
        assert!((snap.cache_hit_rate - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_event_wiring() {
        let monitor = HealthMonitor::new();
        monitor.on_event(Event::QuerySuccess {
            provider: "p".into(),
            latency_ms: 40,
            tokens: 12,
        });
        monitor.on_event(Event::QueryError {
            provider: "p".into(),
            class: "timeout",
            retryable: true,
        });
        let m = monitor.metrics("p").unwrap();
        assert_eq!(m.requests, 2);
        assert_eq!(m.errors, 1);
        assert_eq!(m.tokens, 12);
    }

    #[test]
    fn test_status_change_emits_once() {
        use parking_lot::Mutex;
        let seen = Arc::new(Mutex::new(0usize));
        let seen2 = Arc::clone(&seen);
        let monitor =
            HealthMonitor::new().with_events(Arc::new(crate::events::FnEventHandler(move |e| {
                if matches!(e, Event::HealthUpdate { .. }) {
                    *seen2.lock() += 1;
                }
            })));
        monitor.set_status("a", ServiceStatus::Up);
        monitor.set_status("a", ServiceStatus::Up);
        monitor.set_status("a", ServiceStatus::Down);
        assert_eq!(*seen.lock(), 2);
    }

    #[test]
    fn test_persist_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let monitor = HealthMonitor::new();
        monitor.record_request("svc", Some(10), 5, true);
        monitor.persist_snapshot(dir.path()).unwrap();
        let body = std::fs::read_to_string(dir.path().join("system_metrics.json")).unwrap();
        assert!(body.contains("\"requests\": 1"));
    }
}
