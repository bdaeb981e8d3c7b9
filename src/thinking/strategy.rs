//! Thinking strategies: stateful step generators driving the engine.
//!
//! A [`Strategy`] plans one step at a time from the problem and the
//! steps completed so far; returning `None` marks the process complete.
//! Strategies are values created per process by the [`StrategyFactory`];
//! nothing is shared between processes.

use super::{StepStatus, ThinkingStep};
use serde::Serialize;

/// The plan for one upcoming step.
#[derive(Debug, Clone)]
pub struct StepPlan {
    /// Short human-readable label.
    pub description: String,
    /// Role directive appended to the running context when prompting.
    pub directive: String,
}

/// A visualization of step relationships: nodes plus directed edges.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Visualization {
    /// One node per step.
    pub nodes: Vec<VisualizationNode>,
    /// Directed edges between step nodes.
    pub edges: Vec<VisualizationEdge>,
}

/// One node of a step visualization.
#[derive(Debug, Clone, Serialize)]
pub struct VisualizationNode {
    /// Step id.
    pub id: String,
    /// Step description.
    pub label: String,
    /// Step status wire string.
    pub status: String,
}

/// One edge of a step visualization.
#[derive(Debug, Clone, Serialize)]
pub struct VisualizationEdge {
    /// Source step id.
    pub from: String,
    /// Target step id.
    pub to: String,
}

/// A stateful step generator.
pub trait Strategy: Send {
    /// Strategy name (one of the fixed model-name set).
    fn name(&self) -> &'static str;

    /// Plan the next step, or `None` when the process is complete.
    fn next_step(&mut self, problem: &str, prior: &[ThinkingStep]) -> Option<StepPlan>;

    /// Describe step relationships for visualization. The default is a
    /// linear chain.
    fn visualize(&self, steps: &[ThinkingStep]) -> Visualization {
        let nodes = steps
            .iter()
            .map(|s| VisualizationNode {
                id: s.id.clone(),
                label: s.description.clone(),
                status: s.status.as_str().to_string(),
            })
            .collect();
        let edges = steps
            .windows(2)
            .map(|pair| VisualizationEdge {
                from: pair[0].id.clone(),
                to: pair[1].id.clone(),
            })
            .collect();
        Visualization { nodes, edges }
    }
}

/// Linear decomposition: understand, decompose, solve, synthesize.
pub struct ChainOfThought {
    phase: usize,
}

impl ChainOfThought {
    const PHASES: [(&'static str, &'static str); 4] = [
        (
            "Understand the problem",
            "Restate the problem in your own words and identify what is being asked.",
        ),
        (
            "Decompose into parts",
            "Break the problem into the smallest independent sub-problems.",
        ),
        (
            "Work through each part",
            "Solve each sub-problem in order, showing the reasoning.",
        ),
        (
            "Synthesize the answer",
            "Combine the partial results into a single, direct answer.",
        ),
    ];

    /// Start at the first phase.
    pub fn new() -> Self {
        Self { phase: 0 }
    }
}

impl Default for ChainOfThought {
    fn default() -> Self {
        Self::new()
    }
}

impl Strategy for ChainOfThought {
    fn name(&self) -> &'static str {
        "chain_of_thought"
    }

    fn next_step(&mut self, _problem: &str, _prior: &[ThinkingStep]) -> Option<StepPlan> {
        let (description, directive) = Self::PHASES.get(self.phase)?;
        self.phase += 1;
        Some(StepPlan {
            description: (*description).to_string(),
            directive: (*directive).to_string(),
        })
    }
}

/// Branching exploration: candidate approaches, evaluation, conclusion.
pub struct TreeOfThoughts {
    branches: usize,
    emitted: usize,
}

impl TreeOfThoughts {
    /// Explore `branches` candidate approaches before evaluating.
    pub fn new(branches: usize) -> Self {
        Self {
            branches: branches.max(1),
            emitted: 0,
        }
    }
}

impl Strategy for TreeOfThoughts {
    fn name(&self) -> &'static str {
        "tree_of_thoughts"
    }

    fn next_step(&mut self, _problem: &str, _prior: &[ThinkingStep]) -> Option<StepPlan> {
        let step = self.emitted;
        self.emitted += 1;
        if step < self.branches {
            Some(StepPlan {
                description: format!("Explore approach {}", step + 1),
                directive: format!(
                    "Propose approach #{} to the problem, distinct from earlier approaches, \
                     and sketch how it would play out.",
                    step + 1
                ),
            })
        } else if step == self.branches {
            Some(StepPlan {
                description: "Evaluate the approaches".to_string(),
                directive: "Compare the explored approaches on correctness and cost; \
                            pick the strongest."
                    .to_string(),
            })
        } else if step == self.branches + 1 {
            Some(StepPlan {
                description: "Conclude".to_string(),
                directive: "Carry the chosen approach through to a final answer.".to_string(),
            })
        } else {
            None
        }
    }

    /// Branches fan out from a root exploration and join at evaluation.
    fn visualize(&self, steps: &[ThinkingStep]) -> Visualization {
        let nodes: Vec<VisualizationNode> = steps
            .iter()
            .map(|s| VisualizationNode {
                id: s.id.clone(),
                label: s.description.clone(),
                status: s.status.as_str().to_string(),
            })
            .collect();
        let mut edges = Vec::new();
        if steps.len() > self.branches {
            let eval = &steps[self.branches.min(steps.len() - 1)];
            for branch in steps.iter().take(self.branches) {
                edges.push(VisualizationEdge {
                    from: branch.id.clone(),
                    to: eval.id.clone(),
                });
            }
            // Evaluation chains to any remaining steps.
            for pair in steps[self.branches..].windows(2) {
                edges.push(VisualizationEdge {
                    from: pair[0].id.clone(),
                    to: pair[1].id.clone(),
                });
            }
        }
        Visualization { nodes, edges }
    }
}

/// Open-ended stepping until the model signals `FINAL ANSWER`.
pub struct StepwiseRefinement;

impl Strategy for StepwiseRefinement {
    fn name(&self) -> &'static str {
        "stepwise_refinement"
    }

    fn next_step(&mut self, _problem: &str, prior: &[ThinkingStep]) -> Option<StepPlan> {
        if prior
            .iter()
            .rev()
            .find(|s| s.status == StepStatus::Completed)
            .is_some_and(|s| s.reasoning.to_uppercase().contains("FINAL ANSWER"))
        {
            return None;
        }
        Some(StepPlan {
            description: format!("Refinement step {}", prior.len() + 1),
            directive: "Advance the solution by one concrete step. When the solution is \
                        complete, start the response with FINAL ANSWER."
                .to_string(),
        })
    }
}

/// The fixed set of valid thinking-model names.
pub const KNOWN_MODELS: [&str; 3] = ["chain_of_thought", "tree_of_thoughts", "stepwise_refinement"];

/// Creates strategy instances by name, with complexity-based
/// auto-selection when the caller leaves the model unset.
#[derive(Debug, Clone)]
pub struct StrategyFactory {
    default_model: String,
}

impl StrategyFactory {
    /// Factory falling back to `default_model` on unknown names.
    pub fn new(default_model: impl Into<String>) -> Self {
        let default_model = default_model.into();
        debug_assert!(KNOWN_MODELS.contains(&default_model.as_str()));
        Self { default_model }
    }

    /// Whether `name` is a valid thinking model.
    pub fn is_known(&self, name: &str) -> bool {
        KNOWN_MODELS.contains(&name)
    }

    /// Resolve a requested name: unknown names fall back to the default.
    pub fn resolve<'a>(&'a self, requested: Option<&'a str>) -> &'a str {
        match requested {
            Some(name) if self.is_known(name) => name,
            Some(name) => {
                tracing::debug!(requested = name, "unknown thinking model, using default");
                &self.default_model
            }
            None => &self.default_model,
        }
    }

    /// Instantiate a strategy for a resolved name.
    pub fn create(&self, name: &str) -> Box<dyn Strategy> {
        match name {
            "tree_of_thoughts" => Box::new(TreeOfThoughts::new(2)),
            "stepwise_refinement" => Box::new(StepwiseRefinement),
            _ => Box::new(ChainOfThought::new()),
        }
    }

    /// Pick a model for a problem by complexity: length, reasoning
    /// keyword density, and structural markers.
    pub fn auto_select(&self, problem: &str) -> &'static str {
        let words = problem.split_whitespace().count();
        let lower = problem.to_lowercase();
        let keywords = [
            "why", "how", "prove", "design", "compare", "optimize", "trade-off", "evaluate",
        ]
        .iter()
        .filter(|k| lower.contains(*k))
        .count();
        let structural = problem.lines().count().saturating_sub(1)
            + problem.matches("```").count()
            + problem.matches("- ").count();

        let complexity = words / 40 + keywords * 2 + structural;
        if complexity >= 6 {
            "tree_of_thoughts"
        } else if complexity >= 3 {
            "stepwise_refinement"
        } else {
            "chain_of_thought"
        }
    }
}
