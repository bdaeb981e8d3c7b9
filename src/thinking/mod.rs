//! The thinking engine: drives a strategy's step sequence end to end.
//!
//! One [`ThinkingProcess`] per problem. The engine resolves a strategy,
//! builds each step's prompt from the running context, consults the
//! cache before dispatching to providers, records steps append-only, and
//! finalizes into a one-shot terminal state
//! (`in_progress -> completed | error`). Finalized processes are
//! persisted under `thinking/<processId>` and kept in an in-memory
//! history.

pub mod strategy;

pub use strategy::{StrategyFactory, Visualization};

use crate::cache::{fingerprint, hash_str, CacheLayer};
use crate::dispatch::FallbackDispatcher;
use crate::error::{ProcessorError, Result};
use crate::events::{emit, Event, EventHandler};
use crate::memory::{MemoryKind, MemoryStore};
use crate::prompt;
use crate::provider::LlmRequest;
use crate::tokens::{OptimizeHints, TokenOptimizer};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Role directive prepended to every step prompt.
const SYSTEM_PROMPT: &str = "You are a careful reasoning engine. Work strictly on the step you \
are given, building on the context provided, and answer concisely.";

/// Lifecycle of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Planned, not yet started.
    Pending,
    /// Currently executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Failed.
    Error,
}

impl StepStatus {
    /// Stable wire string.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Error => "error",
        }
    }
}

/// One recorded reasoning step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingStep {
    /// Step id, unique within the process.
    pub id: String,
    /// What the step set out to do.
    pub description: String,
    /// The model's reasoning text (or the error description).
    pub reasoning: String,
    /// Step status.
    pub status: StepStatus,
    /// Tokens consumed by the step.
    pub tokens: u32,
    /// When the step finished.
    pub created: DateTime<Utc>,
    /// Whether the step was served from the cache.
    #[serde(default)]
    pub from_cache: bool,
}

/// Terminal-state machine of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    /// Steps still being produced.
    InProgress,
    /// Finished; every step completed.
    Completed,
    /// Aborted on a step failure or cancellation.
    Error,
}

/// The full reasoning artifact returned to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingProcess {
    /// Unique process id.
    pub process_id: String,
    /// The problem as given.
    pub problem: String,
    /// Resolved thinking model (strategy name).
    pub model_name: String,
    /// Steps in emission order, append-only.
    pub steps: Vec<ThinkingStep>,
    /// When processing began.
    pub started: DateTime<Utc>,
    /// Terminal status (one-shot).
    pub status: ProcessStatus,
    /// Error description when `status == Error`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// `last step created - started`, in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Step-relationship artifact, when requested.
    #[serde(skip_serializing_if = "Option::is_none", skip_deserializing)]
    pub visualization: Option<Visualization>,
}

/// Per-call options.
#[derive(Default)]
pub struct ThinkingOptions {
    /// Requested thinking model; unknown names fall back, `None`
    /// auto-selects by complexity.
    pub thinking_model: Option<String>,
    /// Attach a visualization artifact to the result.
    pub include_visualization: bool,
    /// Let the token optimizer pick the LLM tier.
    pub optimize_tokens: bool,
    /// Cooperative cancellation flag.
    pub cancel: Option<Arc<AtomicBool>>,
}

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Thinking model used when resolution falls through.
    pub default_thinking_model: String,
    /// LLM model used when token optimization is off.
    pub llm_model: String,
    /// Hard cap on steps per process.
    pub max_steps: usize,
    /// Sampling temperature for step calls.
    pub temperature: f64,
    /// Completion budget for step calls.
    pub max_tokens: u32,
    /// Memories woven into the first step's context.
    pub memory_context_items: usize,
    /// History entries kept after maintenance.
    pub max_history: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_thinking_model: "chain_of_thought".to_string(),
            llm_model: "default-llm".to_string(),
            max_steps: 10,
            temperature: 0.7,
            max_tokens: 2048,
            memory_context_items: 3,
            max_history: 100,
        }
    }
}

/// The thinking engine (C7).
pub struct ThinkingEngine {
    dispatcher: Arc<FallbackDispatcher>,
    cache: Arc<CacheLayer>,
    memory: Option<Arc<MemoryStore>>,
    optimizer: Option<Arc<TokenOptimizer>>,
    factory: StrategyFactory,
    config: EngineConfig,
    events: Option<Arc<dyn EventHandler>>,
    history: RwLock<Vec<ThinkingProcess>>,
    thinking_dir: Option<PathBuf>,
    disk_ok: AtomicBool,
}

impl ThinkingEngine {
    /// Build an engine over a dispatcher and cache.
    pub fn new(
        dispatcher: Arc<FallbackDispatcher>,
        cache: Arc<CacheLayer>,
        config: EngineConfig,
    ) -> Self {
        let factory = StrategyFactory::new(config.default_thinking_model.clone());
        Self {
            dispatcher,
            cache,
            memory: None,
            optimizer: None,
            factory,
            config,
            events: None,
            history: RwLock::new(Vec::new()),
            thinking_dir: None,
            disk_ok: AtomicBool::new(true),
        }
    }

    /// Weave memory retrieval into first-step context and record
    /// finished processes as episodic memory.
    pub fn with_memory(mut self, memory: Arc<MemoryStore>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Let the token optimizer select LLM tiers and track accuracy.
    pub fn with_optimizer(mut self, optimizer: Arc<TokenOptimizer>) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    /// Attach an event sink for `StepCompleted`.
    pub fn with_events(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = Some(events);
        self
    }

    /// Persist finalized processes under `dir` (the `thinking/` directory).
    pub fn with_history_dir(mut self, dir: PathBuf) -> Self {
        self.thinking_dir = Some(dir);
        self
    }

    /// Run one thinking process to a terminal state.
    pub async fn process(&self, problem: &str, options: ThinkingOptions) -> Result<ThinkingProcess> {
        if problem.trim().is_empty() {
            return Err(ProcessorError::invalid_input(
                "problem must not be empty",
                &[
                    "pass the problem statement in `problem`",
                    "see tools/list for the thinking_process schema",
                ],
            ));
        }

        let model_name = match options.thinking_model.as_deref() {
            Some(requested) => self.factory.resolve(Some(requested)).to_string(),
            None => self.factory.auto_select(problem).to_string(),
        };
        let mut strategy = self.factory.create(&model_name);

        let llm_model = if options.optimize_tokens {
            match self.optimizer {
                Some(ref opt) => {
                    opt.optimize(problem, &OptimizeHints::default())
                        .selected_model
                }
                None => self.config.llm_model.clone(),
            }
        } else {
            self.config.llm_model.clone()
        };

        let process_id = uuid::Uuid::new_v4().to_string();
        let started = Utc::now();
        let mut steps: Vec<ThinkingStep> = Vec::new();
        let mut failure: Option<String> = None;

        tracing::info!(%process_id, model = %model_name, "thinking process started");

        while steps.len() < self.config.max_steps {
            if let Some(ref cancel) = options.cancel {
                if cancel.load(Ordering::Relaxed) {
                    failure = Some("cancelled".to_string());
                    break;
                }
            }

            let Some(plan) = strategy.next_step(problem, &steps) else {
                break;
            };

            let step_prompt = self.build_step_prompt(problem, &steps, &plan.directive);
            match self.run_step(&llm_model, &step_prompt, problem).await {
                Ok((reasoning, tokens, from_cache)) => {
                    let index = steps.len();
                    steps.push(ThinkingStep {
                        id: format!("step-{}", index + 1),
                        description: plan.description,
                        reasoning,
                        status: StepStatus::Completed,
                        tokens,
                        created: Utc::now(),
                        from_cache,
                    });
                    emit(
                        &self.events,
                        Event::StepCompleted {
                            process_id: process_id.clone(),
                            index,
                            from_cache,
                        },
                    );
                }
                Err(e) => {
                    steps.push(ThinkingStep {
                        id: format!("step-{}", steps.len() + 1),
                        description: plan.description,
                        reasoning: e.to_string(),
                        status: StepStatus::Error,
                        tokens: 0,
                        created: Utc::now(),
                        from_cache: false,
                    });
                    failure = Some(format!("{}: {}", e.class(), e));
                    break;
                }
            }
        }

        let duration_ms = steps
            .last()
            .map(|s| (s.created - started).num_milliseconds().max(0) as u64)
            .unwrap_or(0);

        let mut process = ThinkingProcess {
            process_id,
            problem: problem.to_string(),
            model_name,
            status: if failure.is_some() {
                ProcessStatus::Error
            } else {
                ProcessStatus::Completed
            },
            error: failure,
            duration_ms: Some(duration_ms),
            visualization: None,
            steps,
            started,
        };

        if options.include_visualization {
            process.visualization = Some(strategy.visualize(&process.steps));
        }

        self.finalize(&process);
        Ok(process)
    }

    /// Build a step prompt: problem, memory context (first step), prior
    /// step summaries, then the strategy's directive.
    fn build_step_prompt(&self, problem: &str, prior: &[ThinkingStep], directive: &str) -> String {
        let mut sections = vec![prompt::section("PROBLEM", problem)];

        if prior.is_empty() {
            if let Some(ref memory) = self.memory {
                let recalled: Vec<String> = memory
                    .retrieve(problem, self.config.memory_context_items)
                    .into_iter()
                    .map(|hit| hit.item.content)
                    .collect();
                if !recalled.is_empty() {
                    sections.push(prompt::section(
                        "RELEVANT MEMORY",
                        &prompt::numbered_list(&recalled),
                    ));
                }
            }
        } else {
            let summaries: Vec<String> = prior
                .iter()
                .map(|s| format!("{}: {}", s.description, s.reasoning))
                .collect();
            sections.push(prompt::section(
                "STEPS SO FAR",
                &prompt::numbered_list(&summaries),
            ));
        }

        sections.push(prompt::section("THIS STEP", directive));
        sections.join("\n\n")
    }

    /// Execute one step: cache first, then dispatch.
    async fn run_step(
        &self,
        llm_model: &str,
        step_prompt: &str,
        problem: &str,
    ) -> Result<(String, u32, bool)> {
        let cache_key = fingerprint(&json!({
            "model": llm_model,
            "system": hash_str(SYSTEM_PROMPT),
            "prompt": hash_str(step_prompt),
        }));

        if let Some(cached) = self.cache.get("thinking_cache", &cache_key) {
            let reasoning = cached
                .get("reasoning")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let tokens = cached
                .get("tokens")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(0) as u32;
            return Ok((reasoning, tokens, true));
        }

        let request = LlmRequest::prompt(llm_model, step_prompt)
            .with_system_prompt(SYSTEM_PROMPT)
            .with_temperature(self.config.temperature)
            .with_max_tokens(self.config.max_tokens);
        let response = self.dispatcher.dispatch(&request).await?;

        if let Some(ref optimizer) = self.optimizer {
            optimizer.record_actual(
                problem,
                optimizer.estimate(step_prompt),
                response.usage.prompt,
                llm_model,
            );
        }

        let _ = self.cache.set(
            "thinking_cache",
            &cache_key,
            json!({"reasoning": response.text, "tokens": response.usage.total}),
            None,
        );

        Ok((response.text, response.usage.total, false))
    }

    /// Record the finished process: history, disk, episodic memory.
    fn finalize(&self, process: &ThinkingProcess) {
        self.history.write().push(process.clone());

        if let Some(ref dir) = self.thinking_dir {
            if self.disk_ok.load(Ordering::Relaxed) {
                let result = (|| -> Result<()> {
                    std::fs::create_dir_all(dir)?;
                    std::fs::write(
                        dir.join(&process.process_id),
                        serde_json::to_vec_pretty(process)?,
                    )?;
                    Ok(())
                })();
                if let Err(e) = result {
                    if self.disk_ok.swap(false, Ordering::Relaxed) {
                        tracing::warn!(error = %e, "thinking history write failed; continuing in memory");
                    }
                }
            }
        }

        if process.status == ProcessStatus::Completed {
            if let (Some(memory), Some(last)) = (&self.memory, process.steps.last()) {
                let summary = format!("{} => {}", process.problem, last.reasoning);
                if let Err(e) =
                    memory.store(MemoryKind::Episodic, summary, 0.5, BTreeSet::new())
                {
                    tracing::debug!(error = %e, "episodic record skipped");
                }
            }
        }
    }

    /// Finished processes, oldest first.
    pub fn history(&self) -> Vec<ThinkingProcess> {
        self.history.read().clone()
    }

    /// Look up one finished process.
    pub fn get_process(&self, process_id: &str) -> Option<ThinkingProcess> {
        self.history
            .read()
            .iter()
            .find(|p| p.process_id == process_id)
            .cloned()
    }

    /// Trim history to the configured cap, removing persisted records of
    /// dropped processes. Returns the number removed.
    pub fn maintenance(&self) -> usize {
        let mut history = self.history.write();
        if history.len() <= self.config.max_history {
            return 0;
        }
        let excess = history.len() - self.config.max_history;
        let dropped: Vec<ThinkingProcess> = history.drain(0..excess).collect();
        drop(history);

        if let Some(ref dir) = self.thinking_dir {
            for process in &dropped {
                let _ = std::fs::remove_file(dir.join(&process.process_id));
            }
        }
        dropped.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, CacheLayer};
    use crate::dispatch::{DispatcherConfig, ProviderDescriptor};
    use crate::memory::HashEmbedder;
    use crate::provider::{MockOutcome, MockProvider, ProviderClient};
    use std::time::Duration;

    fn engine_with(mock: Arc<MockProvider>) -> ThinkingEngine {
        let dispatcher = Arc::new(FallbackDispatcher::new(DispatcherConfig {
            max_retries: 2,
            default_deadline: Duration::from_secs(2),
            round_delay_base: Duration::from_millis(1),
            health_check_interval: Duration::from_secs(60),
        }));
        dispatcher.register(ProviderDescriptor {
            name: "mock".into(),
            priority: 1,
            weight: 1.0,
            max_timeout: Duration::from_millis(200),
            client: mock as Arc<dyn ProviderClient>,
        });
        let cache = Arc::new(CacheLayer::memory_only(CacheConfig::default()));
        ThinkingEngine::new(dispatcher, cache, EngineConfig::default())
    }

    fn canned_steps() -> Vec<String> {
        vec![
            "The task is to order ten integers.".into(),
            "Parts: choose an algorithm, apply it.".into(),
            "Applying the algorithm to the list.".into(),
            "Use quicksort, O(n log n) on average.".into(),
        ]
    }

    #[tokio::test]
    async fn test_happy_path_thinking() {
        let mock = Arc::new(MockProvider::replies(canned_steps()));
        let engine = engine_with(Arc::clone(&mock));

        let process = engine
            .process(
                "Sort a list of 10 integers in the most efficient way.",
                ThinkingOptions {
                    thinking_model: Some("chain_of_thought".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(process.status, ProcessStatus::Completed);
        assert!(process.steps.len() >= 2);
        assert!(process
            .steps
            .last()
            .unwrap()
            .reasoning
            .contains("quicksort"));
        assert!(process.duration_ms.unwrap_or(0) < 10_000);
        assert!(process
            .steps
            .iter()
            .all(|s| s.status == StepStatus::Completed));
    }

    #[tokio::test]
    async fn test_empty_problem_no_provider_call() {
        let mock = Arc::new(MockProvider::fixed("x"));
        let engine = engine_with(Arc::clone(&mock));
        let err = engine
            .process("   ", ThinkingOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessorError::InvalidInput { .. }));
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_repeat_process_served_from_cache() {
        let mock = Arc::new(MockProvider::replies(canned_steps()));
        let engine = engine_with(Arc::clone(&mock));
        let options = || ThinkingOptions {
            thinking_model: Some("chain_of_thought".into()),
            ..Default::default()
        };

        let first = engine.process("Same problem.", options()).await.unwrap();
        let calls_after_first = mock.call_count();
        let second = engine.process("Same problem.", options()).await.unwrap();

        assert_eq!(mock.call_count(), calls_after_first);
        assert!(second.steps.iter().all(|s| s.from_cache));
        assert!(first.steps.iter().all(|s| !s.from_cache));
        assert_eq!(
            first.steps.last().unwrap().reasoning,
            second.steps.last().unwrap().reasoning
        );
    }

    #[tokio::test]
    async fn test_step_error_marks_process() {
        let mock = Arc::new(MockProvider::new(
            "mock",
            vec![
                MockOutcome::Text("first step fine".into()),
                MockOutcome::Http(400),
            ],
        ));
        let engine = engine_with(mock);

        let process = engine
            .process(
                "Trip on the second step.",
                ThinkingOptions {
                    thinking_model: Some("chain_of_thought".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(process.status, ProcessStatus::Error);
        assert!(process.error.as_deref().unwrap().contains("all_providers_failed"));
        assert_eq!(process.steps.len(), 2);
        assert_eq!(process.steps[0].status, StepStatus::Completed);
        assert_eq!(process.steps[1].status, StepStatus::Error);
    }

    #[tokio::test]
    async fn test_max_steps_enforced() {
        let mock = Arc::new(MockProvider::fixed("keep going"));
        let mut engine = engine_with(mock);
        engine.config.max_steps = 3;

        // stepwise_refinement never sees FINAL ANSWER, so the cap binds.
        let process = engine
            .process(
                "An endless problem.",
                ThinkingOptions {
                    thinking_model: Some("stepwise_refinement".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(process.steps.len(), 3);
        assert_eq!(process.status, ProcessStatus::Completed);
    }

    #[tokio::test]
    async fn test_unknown_model_falls_back() {
        let mock = Arc::new(MockProvider::replies(canned_steps()));
        let engine = engine_with(mock);
        let process = engine
            .process(
                "A problem.",
                ThinkingOptions {
                    thinking_model: Some("made_up_model".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(process.model_name, "chain_of_thought");
    }

    #[tokio::test]
    async fn test_visualization_attached_on_request() {
        let mock = Arc::new(MockProvider::replies(canned_steps()));
        let engine = engine_with(mock);
        let process = engine
            .process(
                "A problem.",
                ThinkingOptions {
                    thinking_model: Some("chain_of_thought".into()),
                    include_visualization: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let viz = process.visualization.unwrap();
        assert_eq!(viz.nodes.len(), process.steps.len());
        assert_eq!(viz.edges.len(), process.steps.len() - 1);
    }

    #[tokio::test]
    async fn test_cancellation_marks_error() {
        let mock = Arc::new(MockProvider::fixed("x"));
        let engine = engine_with(Arc::clone(&mock));
        let cancel = Arc::new(AtomicBool::new(true));
        let process = engine
            .process(
                "A problem.",
                ThinkingOptions {
                    cancel: Some(cancel),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(process.status, ProcessStatus::Error);
        assert_eq!(process.error.as_deref(), Some("cancelled"));
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_history_and_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockProvider::replies(canned_steps()));
        let engine = engine_with(mock).with_history_dir(dir.path().to_path_buf());

        let process = engine
            .process(
                "A problem.",
                ThinkingOptions {
                    thinking_model: Some("chain_of_thought".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(dir.path().join(&process.process_id).exists());
        assert_eq!(engine.history().len(), 1);
        assert!(engine.get_process(&process.process_id).is_some());
    }

    #[tokio::test]
    async fn test_completed_process_recorded_in_memory() {
        let mock = Arc::new(MockProvider::replies(canned_steps()));
        let memory = Arc::new(MemoryStore::in_memory(Arc::new(HashEmbedder::default())));
        let engine = engine_with(mock).with_memory(Arc::clone(&memory));

        engine
            .process(
                "A problem worth remembering.",
                ThinkingOptions {
                    thinking_model: Some("chain_of_thought".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let episodic = memory.get_by_type(MemoryKind::Episodic);
        assert_eq!(episodic.len(), 1);
        assert!(episodic[0].content.contains("A problem worth remembering."));
    }

    #[tokio::test]
    async fn test_maintenance_trims_history() {
        let mock = Arc::new(MockProvider::replies(canned_steps()));
        let mut engine = engine_with(mock);
        engine.config.max_history = 2;
        for i in 0..4 {
            engine
                .process(
                    &format!("Problem {}", i),
                    ThinkingOptions {
                        thinking_model: Some("chain_of_thought".into()),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        assert_eq!(engine.maintenance(), 2);
        assert_eq!(engine.history().len(), 2);
    }
}
