//! Multi-stage pipeline orchestrator with inter-stage token passing.
//!
//! Stages execute strictly in index order -- stage `i+1` never begins
//! before stage `i` completes -- with a minimum separation delay between
//! them to enforce isolation. Between stages an [`InterStageToken`]
//! accumulates monotonically: completed stage indexes, plus entities,
//! themes, relationships, and conclusions extracted from stage output
//! via labeled-section patterns.
//!
//! Each stage's prompt is assembled from the original query, the
//! previous stage's output, the current token state, and the stage's
//! role directive. Stage output is guaranteed to begin with a
//! `STAGE <n> ANALYSIS:` marker (prepended when the model omits it).
//!
//! Any stage failure aborts the run; the result preserves completed
//! intermediates with `success = false` and an empty final text.

use crate::dispatch::FallbackDispatcher;
use crate::error::{ProcessorError, Result};
use crate::events::{emit, Event, EventHandler};
use crate::prompt;
use crate::provider::{LlmRequest, ProviderClient};
use regex::Regex;
use serde::Serialize;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

/// Phase of a pipeline run, advancing with stage index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelinePhase {
    /// First stage.
    Preprocessing,
    /// Second stage.
    Processing,
    /// Third stage onward.
    Reasoning,
}

impl PipelinePhase {
    /// Phase for a 0-based stage index.
    pub fn for_index(index: usize) -> Self {
        match index {
            0 => PipelinePhase::Preprocessing,
            1 => PipelinePhase::Processing,
            _ => PipelinePhase::Reasoning,
        }
    }
}

/// Structured summary threaded between stages. Accumulates
/// monotonically: nothing is ever removed by later stages.
#[derive(Debug, Clone, Serialize)]
pub struct InterStageToken {
    /// The query that started the run.
    pub original_query: String,
    /// Current phase.
    pub phase: PipelinePhase,
    /// Indexes of completed stages, in order.
    pub completed_stages: Vec<usize>,
    /// Extracted entity mentions.
    pub entities: Vec<String>,
    /// Extracted themes.
    pub themes: Vec<String>,
    /// Extracted relationships.
    pub relationships: Vec<String>,
    /// Extracted conclusions.
    pub conclusions: Vec<String>,
    /// The latest stage's suggested focus, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_focus: Option<String>,
}

impl InterStageToken {
    /// Fresh token for a query.
    pub fn new(original_query: impl Into<String>) -> Self {
        Self {
            original_query: original_query.into(),
            phase: PipelinePhase::Preprocessing,
            completed_stages: Vec::new(),
            entities: Vec::new(),
            themes: Vec::new(),
            relationships: Vec::new(),
            conclusions: Vec::new(),
            next_focus: None,
        }
    }

    /// Fold one completed stage's output into the token.
    pub fn absorb(&mut self, stage_index: usize, output: &str) {
        self.completed_stages.push(stage_index);
        self.phase = PipelinePhase::for_index(stage_index + 1);

        append_unique(&mut self.entities, extract_list(output, "ENTITIES"));
        append_unique(&mut self.themes, extract_list(output, "THEMES"));
        append_unique(&mut self.relationships, extract_list(output, "RELATIONSHIPS"));
        append_unique(&mut self.conclusions, extract_list(output, "CONCLUSIONS"));
        if let Some(focus) = extract_single(output, "NEXT FOCUS") {
            self.next_focus = Some(focus);
        }
    }

    /// Compact textual rendering for prompt context.
    fn render(&self) -> String {
        let mut lines = Vec::new();
        if !self.entities.is_empty() {
            lines.push(format!("Entities: {}", self.entities.join(", ")));
        }
        if !self.themes.is_empty() {
            lines.push(format!("Themes: {}", self.themes.join(", ")));
        }
        if !self.relationships.is_empty() {
            lines.push(format!("Relationships: {}", self.relationships.join(", ")));
        }
        if !self.conclusions.is_empty() {
            lines.push(format!("Conclusions so far: {}", self.conclusions.join(", ")));
        }
        if let Some(ref focus) = self.next_focus {
            lines.push(format!("Suggested focus: {}", focus));
        }
        if lines.is_empty() {
            "(no accumulated context yet)".to_string()
        } else {
            lines.join("\n")
        }
    }
}

fn label_regex(label: &str) -> Regex {
    Regex::new(&format!(r"(?im)^\s*{}\s*:\s*(.+)$", label)).expect("valid label pattern")
}

fn extract_list(output: &str, label: &str) -> Vec<String> {
    static CACHE: OnceLock<parking_lot::Mutex<std::collections::HashMap<String, Regex>>> =
        OnceLock::new();
    let cache = CACHE.get_or_init(Default::default);
    let re = cache
        .lock()
        .entry(label.to_string())
        .or_insert_with(|| label_regex(label))
        .clone();

    re.captures_iter(output)
        .flat_map(|cap| {
            cap[1]
                .split([',', ';'])
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
        })
        .collect()
}

fn extract_single(output: &str, label: &str) -> Option<String> {
    extract_list(output, label).into_iter().last()
}

fn append_unique(target: &mut Vec<String>, additions: Vec<String>) {
    for value in additions {
        if !target.iter().any(|v| v.eq_ignore_ascii_case(&value)) {
            target.push(value);
        }
    }
}

/// One stage of a pipeline.
#[derive(Clone)]
pub struct PipelineStage {
    /// Stage name (for prompts, logs, results).
    pub name: String,
    /// Role directive used as the stage's system prompt. Supports
    /// `{input}` for the original query.
    pub system_prompt_template: String,
    /// Model requested from the provider.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f64,
    /// Completion budget.
    pub max_tokens: u32,
    /// Dedicated provider for this stage; `None` routes through the
    /// dispatcher's ranked fallback.
    pub provider: Option<Arc<dyn ProviderClient>>,
}

impl std::fmt::Debug for PipelineStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineStage")
            .field("name", &self.name)
            .field("model", &self.model)
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("has_provider", &self.provider.is_some())
            .finish()
    }
}

impl PipelineStage {
    /// Create a stage with defaults.
    pub fn new(name: impl Into<String>, system_prompt_template: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            system_prompt_template: system_prompt_template.into(),
            model: "default-llm".to_string(),
            temperature: 0.7,
            max_tokens: 2048,
            provider: None,
        }
    }

    /// Set the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the temperature.
    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set the completion budget.
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Pin this stage to a dedicated provider.
    pub fn with_provider(mut self, provider: Arc<dyn ProviderClient>) -> Self {
        self.provider = Some(provider);
        self
    }
}

/// Result of one completed stage.
#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    /// Stage index (0-based).
    pub index: usize,
    /// Stage name.
    pub name: String,
    /// Marker-prefixed stage output.
    pub output: String,
    /// Tokens consumed by the stage.
    pub tokens: u32,
    /// Stage latency in milliseconds.
    pub latency_ms: u64,
}

/// Result of a full pipeline run.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineRunResult {
    /// Whether every stage completed.
    pub success: bool,
    /// Final stage output; empty on failure.
    pub final_output: String,
    /// Completed stage results, in order.
    pub stages: Vec<StageResult>,
    /// Final token state.
    pub token: InterStageToken,
    /// Total tokens across stages.
    pub total_tokens: u32,
    /// Total latency across stages, in milliseconds.
    pub total_latency_ms: u64,
    /// Error description on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Sequential stage executor (C8). Parallel stage execution is
/// deliberately unsupported.
pub struct PipelineOrchestrator {
    dispatcher: Arc<FallbackDispatcher>,
    separation_delay: Duration,
    events: Option<Arc<dyn EventHandler>>,
}

impl PipelineOrchestrator {
    /// Create an orchestrator routing stage calls through `dispatcher`.
    pub fn new(dispatcher: Arc<FallbackDispatcher>) -> Self {
        Self {
            dispatcher,
            separation_delay: Duration::from_secs(1),
            events: None,
        }
    }

    /// Override the minimum delay between stages.
    pub fn with_separation_delay(mut self, delay: Duration) -> Self {
        self.separation_delay = delay;
        self
    }

    /// Attach an event sink for `StageCompleted`.
    pub fn with_events(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = Some(events);
        self
    }

    /// Run the stages in order against `query`.
    pub async fn run(&self, stages: &[PipelineStage], query: &str) -> Result<PipelineRunResult> {
        if query.trim().is_empty() {
            return Err(ProcessorError::invalid_input(
                "query must not be empty",
                &["pass the text to process in `query`"],
            ));
        }
        if stages.is_empty() {
            return Err(ProcessorError::invalid_input(
                "pipeline has no stages",
                &["configure at least one stage"],
            ));
        }

        let mut token = InterStageToken::new(query);
        let mut results: Vec<StageResult> = Vec::new();
        let mut total_tokens = 0u32;
        let mut total_latency_ms = 0u64;

        for (index, stage) in stages.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.separation_delay).await;
            }

            let previous_output = results.last().map(|r| r.output.as_str());
            let request = self.build_request(stage, index, query, previous_output, &token);

            let response = match &stage.provider {
                Some(provider) => provider.query(&request).await,
                None => self.dispatcher.dispatch(&request).await,
            };

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(stage = %stage.name, index, error = %e, "pipeline stage failed");
                    return Ok(PipelineRunResult {
                        success: false,
                        final_output: String::new(),
                        stages: results,
                        token,
                        total_tokens,
                        total_latency_ms,
                        error: Some(format!("stage '{}' failed: {}", stage.name, e)),
                    });
                }
            };

            let output = ensure_marker(index, &response.text);
            token.absorb(index, &output);
            total_tokens += response.usage.total;
            total_latency_ms += response.latency_ms;
            emit(
                &self.events,
                Event::StageCompleted {
                    index,
                    name: stage.name.clone(),
                    tokens: response.usage.total,
                },
            );
            results.push(StageResult {
                index,
                name: stage.name.clone(),
                output,
                tokens: response.usage.total,
                latency_ms: response.latency_ms,
            });
        }

        let final_output = results.last().map(|r| r.output.clone()).unwrap_or_default();
        Ok(PipelineRunResult {
            success: true,
            final_output,
            stages: results,
            token,
            total_tokens,
            total_latency_ms,
            error: None,
        })
    }

    /// Assemble the stage prompt: original query, previous output,
    /// token state, role directive.
    fn build_request(
        &self,
        stage: &PipelineStage,
        index: usize,
        query: &str,
        previous_output: Option<&str>,
        token: &InterStageToken,
    ) -> LlmRequest {
        let vars = std::collections::HashMap::new();
        let system = prompt::render(&stage.system_prompt_template, query, &vars);

        let mut sections = vec![prompt::section("ORIGINAL QUERY", query)];
        if let Some(previous) = previous_output {
            sections.push(prompt::section("PREVIOUS STAGE OUTPUT", previous));
        }
        sections.push(prompt::section("ACCUMULATED CONTEXT", &token.render()));
        sections.push(prompt::section(
            "DIRECTIVE",
            &format!(
                "You are stage {} ({}). Begin your response with \"STAGE {} ANALYSIS:\". \
                 Where applicable, include lines labeled ENTITIES:, THEMES:, RELATIONSHIPS:, \
                 CONCLUSIONS:, and NEXT FOCUS: with comma-separated values.",
                index + 1,
                stage.name,
                index + 1
            ),
        ));

        LlmRequest::prompt(stage.model.clone(), sections.join("\n\n"))
            .with_system_prompt(system)
            .with_temperature(stage.temperature)
            .with_max_tokens(stage.max_tokens)
    }
}

/// Guarantee the stage marker prefix.
fn ensure_marker(index: usize, text: &str) -> String {
    let marker = format!("STAGE {} ANALYSIS:", index + 1);
    let trimmed = text.trim_start();
    if trimmed.to_uppercase().starts_with(&marker) {
        trimmed.to_string()
    } else {
        format!("{}\n{}", marker, text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatcherConfig;
    use crate::provider::{MockOutcome, MockProvider};

    fn orchestrator(mock: Arc<MockProvider>) -> PipelineOrchestrator {
        let dispatcher = Arc::new(FallbackDispatcher::new(DispatcherConfig {
            max_retries: 1,
            default_deadline: Duration::from_secs(2),
            round_delay_base: Duration::from_millis(1),
            health_check_interval: Duration::from_secs(60),
        }));
        dispatcher.register(crate::dispatch::ProviderDescriptor {
            name: "mock".into(),
            priority: 1,
            weight: 1.0,
            max_timeout: Duration::from_millis(500),
            client: mock as Arc<dyn ProviderClient>,
        });
        PipelineOrchestrator::new(dispatcher).with_separation_delay(Duration::from_millis(5))
    }

    fn three_stages() -> Vec<PipelineStage> {
        vec![
            PipelineStage::new("extract", "Identify what the query mentions."),
            PipelineStage::new("connect", "Relate the extracted pieces."),
            PipelineStage::new("conclude", "Draw the final conclusions."),
        ]
    }

    #[tokio::test]
    async fn test_stages_isolated_and_ordered() {
        let mock = Arc::new(
            MockProvider::replies(vec!["one".into(), "two".into(), "three".into()])
                .with_delay(Duration::from_millis(3)),
        );
        let orch = orchestrator(Arc::clone(&mock));

        let result = orch.run(&three_stages(), "a query").await.unwrap();
        assert!(result.success);

        let spans = mock.call_spans();
        assert_eq!(spans.len(), 3);
        assert!(spans[1].started > spans[0].finished);
        assert!(spans[2].started > spans[1].finished);

        assert_eq!(result.token.completed_stages, vec![0, 1, 2]);
        assert!(result.final_output.starts_with("STAGE 3 ANALYSIS:"));
    }

    #[tokio::test]
    async fn test_marker_preserved_when_present() {
        let mock = Arc::new(MockProvider::fixed("STAGE 1 ANALYSIS: already marked"));
        let orch = orchestrator(mock);
        let stages = vec![PipelineStage::new("only", "directive")];
        let result = orch.run(&stages, "q").await.unwrap();
        assert_eq!(result.final_output, "STAGE 1 ANALYSIS: already marked");
    }

    #[tokio::test]
    async fn test_token_accumulates_sections() {
        let mock = Arc::new(MockProvider::replies(vec![
            "STAGE 1 ANALYSIS:\nENTITIES: alice, bob\nTHEMES: trust".into(),
            "STAGE 2 ANALYSIS:\nENTITIES: bob, carol\nRELATIONSHIPS: alice knows bob".into(),
            "STAGE 3 ANALYSIS:\nCONCLUSIONS: the group is connected\nNEXT FOCUS: verify edges"
                .into(),
        ]));
        let orch = orchestrator(mock);

        let result = orch.run(&three_stages(), "who knows whom").await.unwrap();
        let token = &result.token;
        assert_eq!(token.entities, vec!["alice", "bob", "carol"]);
        assert_eq!(token.themes, vec!["trust"]);
        assert_eq!(token.relationships, vec!["alice knows bob"]);
        assert_eq!(token.conclusions, vec!["the group is connected"]);
        assert_eq!(token.next_focus.as_deref(), Some("verify edges"));
        assert_eq!(token.phase, PipelinePhase::Reasoning);
    }

    #[tokio::test]
    async fn test_failure_preserves_intermediates() {
        let mock = Arc::new(MockProvider::new(
            "mock",
            vec![
                MockOutcome::Text("first output".into()),
                MockOutcome::Http(400),
            ],
        ));
        let orch = orchestrator(mock);

        let result = orch.run(&three_stages(), "q").await.unwrap();
        assert!(!result.success);
        assert_eq!(result.final_output, "");
        assert_eq!(result.stages.len(), 1);
        assert!(result.stages[0].output.contains("first output"));
        assert!(result.error.as_deref().unwrap().contains("connect"));
        assert_eq!(result.token.completed_stages, vec![0]);
    }

    #[tokio::test]
    async fn test_empty_query_rejected() {
        let mock = Arc::new(MockProvider::fixed("x"));
        let orch = orchestrator(Arc::clone(&mock));
        let err = orch.run(&three_stages(), "  ").await.unwrap_err();
        assert!(matches!(err, ProcessorError::InvalidInput { .. }));
        assert_eq!(mock.call_count(), 0);
    }

    #[tokio::test]
    async fn test_dedicated_stage_provider() {
        let shared = Arc::new(MockProvider::fixed("from shared"));
        let dedicated = Arc::new(MockProvider::fixed("from dedicated"));
        let orch = orchestrator(Arc::clone(&shared));

        let stages = vec![
            PipelineStage::new("a", "d"),
            PipelineStage::new("b", "d")
                .with_provider(Arc::clone(&dedicated) as Arc<dyn ProviderClient>),
        ];
        let result = orch.run(&stages, "q").await.unwrap();
        assert!(result.success);
        assert!(result.final_output.contains("from dedicated"));
        assert_eq!(shared.call_count(), 1);
        assert_eq!(dedicated.call_count(), 1);
    }

    #[tokio::test]
    async fn test_totals_accumulate() {
        let mock = Arc::new(MockProvider::replies(vec!["one two three".into()]));
        let orch = orchestrator(mock);
        let result = orch.run(&three_stages(), "q").await.unwrap();
        assert!(result.total_tokens > 0);
        let sum: u32 = result.stages.iter().map(|s| s.tokens).sum();
        assert_eq!(result.total_tokens, sum);
    }

    #[test]
    fn test_phase_for_index() {
        assert_eq!(PipelinePhase::for_index(0), PipelinePhase::Preprocessing);
        assert_eq!(PipelinePhase::for_index(1), PipelinePhase::Processing);
        assert_eq!(PipelinePhase::for_index(5), PipelinePhase::Reasoning);
    }

    #[test]
    fn test_extract_list_case_insensitive() {
        let out = "stage text\nentities: X, Y\nother";
        assert_eq!(extract_list(out, "ENTITIES"), vec!["X", "Y"]);
    }

    #[test]
    fn test_absorb_is_monotone() {
        let mut token = InterStageToken::new("q");
        token.absorb(0, "ENTITIES: a");
        token.absorb(1, "no labeled sections here");
        assert_eq!(token.entities, vec!["a"]);
        assert_eq!(token.completed_stages, vec![0, 1]);
    }
}
