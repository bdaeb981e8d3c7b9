//! Event system for dispatcher, health, and process lifecycle hooks.
//!
//! Provides an optional, non-intrusive way to observe the orchestration
//! substrate. The dispatcher emits events on query success/failure, the
//! health monitor on status and metrics changes, and the thinking engine
//! on step completion. Users implement [`EventHandler`] to receive these
//! events for logging, progress tracking, or UIs.

use std::sync::Arc;

/// Events emitted by the orchestration substrate.
#[derive(Debug, Clone)]
pub enum Event {
    /// A provider call completed successfully.
    QuerySuccess {
        /// Name of the responding provider.
        provider: String,
        /// Round-trip latency in milliseconds.
        latency_ms: u64,
        /// Total tokens consumed by the call.
        tokens: u32,
    },
    /// A provider call failed.
    QueryError {
        /// Name of the failing provider.
        provider: String,
        /// Stable error class (see `ProcessorError::class`).
        class: &'static str,
        /// Whether the dispatcher will retry elsewhere.
        retryable: bool,
    },
    /// A service's health status changed.
    HealthUpdate {
        /// Service name.
        service: String,
        /// New status as a stable string (`up`, `degraded`, `down`).
        status: &'static str,
    },
    /// The rolling metrics snapshot was refreshed.
    MetricsUpdate {
        /// Total requests observed so far.
        requests: u64,
        /// Current error rate in `[0,1]`.
        error_rate: f64,
    },
    /// A thinking step finished.
    StepCompleted {
        /// Owning process id.
        process_id: String,
        /// Index of the completed step (0-based).
        index: usize,
        /// Whether the step was served from cache.
        from_cache: bool,
    },
    /// A pipeline stage finished.
    StageCompleted {
        /// Stage index (0-based).
        index: usize,
        /// Stage name.
        name: String,
        /// Tokens consumed by the stage.
        tokens: u32,
    },
}

/// Handler for substrate lifecycle events.
///
/// Implement this trait to receive query outcomes, health transitions,
/// and step/stage completions. This is entirely optional -- every
/// component works without an event handler.
///
/// # Example
///
/// ```
/// use cognitive_processor::events::{Event, EventHandler};
///
/// struct PrintHandler;
///
/// impl EventHandler for PrintHandler {
///     fn on_event(&self, event: Event) {
///         if let Event::QueryError { provider, class, .. } = event {
///             eprintln!("[{}] {}", provider, class);
///         }
///     }
/// }
/// ```
pub trait EventHandler: Send + Sync {
    /// Called when a component emits an event.
    fn on_event(&self, event: Event);
}

/// Emit an event if a handler is present. No-op otherwise.
pub(crate) fn emit(handler: &Option<Arc<dyn EventHandler>>, event: Event) {
    if let Some(ref h) = handler {
        h.on_event(event);
    }
}

/// An [`EventHandler`] backed by a closure.
///
/// # Example
///
/// ```
/// use cognitive_processor::events::{Event, FnEventHandler};
/// use std::sync::Arc;
///
/// let handler = Arc::new(FnEventHandler(|event: Event| {
///     if let Event::QuerySuccess { provider, .. } = event {
///         println!("ok: {}", provider);
///     }
/// }));
/// ```
pub struct FnEventHandler<F: Fn(Event) + Send + Sync>(pub F);

impl<F: Fn(Event) + Send + Sync> EventHandler for FnEventHandler<F> {
    fn on_event(&self, event: Event) {
        (self.0)(event);
    }
}
