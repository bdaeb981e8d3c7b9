//! Token estimation, model-tier selection, and estimate-vs-actual metrics.
//!
//! The optimizer shapes outgoing requests: it estimates token counts with
//! a cheap heuristic, picks a model tier from the configured table when
//! the caller did not choose one, and accumulates prediction-error
//! metrics keyed by `(model, problem pattern)` so the stats endpoints can
//! report how well the heuristic is doing.

use crate::error::{ProcessorError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;

/// Heuristic token count: one token per whitespace-split word, times 1.3.
///
/// Deliberately cheap and deterministic. Providers that report real usage
/// override these numbers; the heuristic fills the gaps.
pub fn estimate_tokens(text: &str) -> u32 {
    let words = text.split_whitespace().count();
    (words as f64 * 1.3).ceil() as u32
}

/// One row of the model-tier table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelTier {
    /// Model identifier passed to providers.
    pub name: String,
    /// Upper bound of estimated prompt tokens this tier is meant for.
    pub max_prompt_tokens: u32,
    /// Multiplier applied to the completion budget for this tier.
    pub token_multiplier: f64,
}

/// Hints accompanying an [`TokenOptimizer::optimize`] call.
#[derive(Debug, Clone, Default)]
pub struct OptimizeHints {
    /// Explicit user model choice; honored verbatim when set.
    pub user_model: Option<String>,
    /// Available completion-token budget, if the caller knows it.
    pub available_tokens: Option<u32>,
}

/// Result of a tier selection.
#[derive(Debug, Clone, Serialize)]
pub struct Optimization {
    /// Chosen model identifier.
    pub selected_model: String,
    /// Estimated prompt tokens for the input.
    pub estimated_tokens: u32,
    /// Which rule chose the model: `user-selected`, `tiered`, or `default`.
    pub strategy: &'static str,
}

/// Estimate-vs-actual record for one problem pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PatternStat {
    model: String,
    samples: u64,
    total_estimated: u64,
    total_actual: u64,
    total_abs_error: u64,
}

/// Aggregate accuracy metrics exposed by the stats endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct TokenStats {
    /// Total recorded samples.
    pub samples: u64,
    /// Mean absolute estimate error in tokens.
    pub mean_abs_error: f64,
    /// Mean relative error: `abs(estimated - actual) / actual`.
    pub mean_error_ratio: f64,
    /// Samples per model.
    pub per_model: HashMap<String, u64>,
}

/// Token optimizer (C6): estimation, tier selection, accuracy tracking.
pub struct TokenOptimizer {
    tiers: Vec<ModelTier>,
    default_model: String,
    /// Keyed by `<model>:<pattern-hash>`.
    patterns: Mutex<HashMap<String, PatternStat>>,
    /// `token_history/` directory; `None` disables persistence.
    history_dir: Option<PathBuf>,
    /// Keep at most this many pattern entries per model after maintenance.
    max_patterns_per_model: usize,
}

impl TokenOptimizer {
    /// Build an optimizer over the given tier table.
    ///
    /// Tiers are consulted in ascending `max_prompt_tokens` order; the
    /// first tier whose bound covers the estimate wins.
    pub fn new(mut tiers: Vec<ModelTier>, default_model: impl Into<String>) -> Self {
        tiers.sort_by_key(|t| t.max_prompt_tokens);
        Self {
            tiers,
            default_model: default_model.into(),
            patterns: Mutex::new(HashMap::new()),
            history_dir: None,
            max_patterns_per_model: 256,
        }
    }

    /// Persist pattern stats under `dir` (the `token_history/` directory).
    pub fn with_history_dir(mut self, dir: PathBuf) -> Self {
        self.history_dir = Some(dir);
        self
    }

    /// Heuristic token count for `text`.
    pub fn estimate(&self, text: &str) -> u32 {
        estimate_tokens(text)
    }

    /// Pick a model for `prompt` honoring the hints.
    pub fn optimize(&self, prompt: &str, hints: &OptimizeHints) -> Optimization {
        let estimated_tokens = self.estimate(prompt);

        if let Some(ref user) = hints.user_model {
            return Optimization {
                selected_model: user.clone(),
                estimated_tokens,
                strategy: "user-selected",
            };
        }

        let budget = hints.available_tokens.unwrap_or(u32::MAX);
        for tier in &self.tiers {
            let fits_estimate = estimated_tokens <= tier.max_prompt_tokens;
            let fits_budget =
                (tier.max_prompt_tokens as f64 * tier.token_multiplier) as u32 <= budget;
            if fits_estimate && fits_budget {
                return Optimization {
                    selected_model: tier.name.clone(),
                    estimated_tokens,
                    strategy: "tiered",
                };
            }
        }

        Optimization {
            selected_model: self.default_model.clone(),
            estimated_tokens,
            strategy: "default",
        }
    }

    /// Record an estimate-vs-actual observation for a problem pattern.
    pub fn record_actual(&self, problem_id: &str, estimated: u32, actual: u32, model: &str) {
        let key = pattern_key(model, problem_id);
        let mut patterns = self.patterns.lock();
        let stat = patterns.entry(key.clone()).or_insert_with(|| PatternStat {
            model: model.to_string(),
            samples: 0,
            total_estimated: 0,
            total_actual: 0,
            total_abs_error: 0,
        });
        stat.samples += 1;
        stat.total_estimated += u64::from(estimated);
        stat.total_actual += u64::from(actual);
        stat.total_abs_error += u64::from(estimated.abs_diff(actual));
        let snapshot = stat.clone();
        drop(patterns);

        if let Some(ref dir) = self.history_dir {
            if let Err(e) = persist_pattern(dir, &key, &snapshot) {
                tracing::warn!(error = %e, "token history write failed; continuing in memory");
            }
        }
    }

    /// Aggregate accuracy metrics across all recorded patterns.
    pub fn stats(&self) -> TokenStats {
        let patterns = self.patterns.lock();
        let mut samples = 0u64;
        let mut abs_error = 0u64;
        let mut actual = 0u64;
        let mut per_model: HashMap<String, u64> = HashMap::new();
        for stat in patterns.values() {
            samples += stat.samples;
            abs_error += stat.total_abs_error;
            actual += stat.total_actual;
            *per_model.entry(stat.model.clone()).or_default() += stat.samples;
        }
        TokenStats {
            samples,
            mean_abs_error: if samples == 0 {
                0.0
            } else {
                abs_error as f64 / samples as f64
            },
            mean_error_ratio: if actual == 0 {
                0.0
            } else {
                abs_error as f64 / actual as f64
            },
            per_model,
        }
    }

    /// Compact pattern history: keep the highest-sample entries per model.
    ///
    /// Returns the number of entries removed.
    pub fn maintenance(&self) -> usize {
        let mut patterns = self.patterns.lock();
        let mut by_model: HashMap<String, Vec<(String, u64)>> = HashMap::new();
        for (key, stat) in patterns.iter() {
            by_model
                .entry(stat.model.clone())
                .or_default()
                .push((key.clone(), stat.samples));
        }

        let mut to_remove = Vec::new();
        for (_, mut entries) in by_model {
            if entries.len() <= self.max_patterns_per_model {
                continue;
            }
            entries.sort_by(|a, b| b.1.cmp(&a.1));
            for (key, _) in entries.into_iter().skip(self.max_patterns_per_model) {
                to_remove.push(key);
            }
        }

        for key in &to_remove {
            patterns.remove(key);
            if let Some(ref dir) = self.history_dir {
                let _ = std::fs::remove_file(dir.join(key));
            }
        }
        to_remove.len()
    }
}

/// File/map key for one `(model, problem)` pattern.
fn pattern_key(model: &str, problem_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(problem_id.as_bytes());
    let hex = format!("{:x}", hasher.finalize());
    // Model name is sanitized for use in file names.
    let model: String = model
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect();
    format!("{}:{}", model, &hex[..16])
}

fn persist_pattern(dir: &std::path::Path, key: &str, stat: &PatternStat) -> Result<()> {
    std::fs::create_dir_all(dir)?;
    let body = serde_json::to_vec_pretty(stat)?;
    std::fs::write(dir.join(key), body)
        .map_err(|e| ProcessorError::Persistence(format!("token history '{}': {}", key, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiers() -> Vec<ModelTier> {
        vec![
            ModelTier {
                name: "small".into(),
                max_prompt_tokens: 100,
                token_multiplier: 1.0,
            },
            ModelTier {
                name: "large".into(),
                max_prompt_tokens: 10_000,
                token_multiplier: 2.0,
            },
        ]
    }

    #[test]
    fn test_estimate_is_word_based() {
        assert_eq!(estimate_tokens(""), 0);
        assert_eq!(estimate_tokens("one"), 2); // ceil(1 * 1.3)
        assert_eq!(estimate_tokens("three little words"), 4); // ceil(3.9)
    }

    #[test]
    fn test_user_model_wins() {
        let opt = TokenOptimizer::new(tiers(), "fallback");
        let hints = OptimizeHints {
            user_model: Some("custom".into()),
            available_tokens: None,
        };
        let result = opt.optimize("some prompt", &hints);
        assert_eq!(result.selected_model, "custom");
        assert_eq!(result.strategy, "user-selected");
    }

    #[test]
    fn test_tier_selection_by_size() {
        let opt = TokenOptimizer::new(tiers(), "fallback");
        let short = opt.optimize("short prompt", &OptimizeHints::default());
        assert_eq!(short.selected_model, "small");
        assert_eq!(short.strategy, "tiered");

        let long_text = "word ".repeat(200);
        let long = opt.optimize(&long_text, &OptimizeHints::default());
        assert_eq!(long.selected_model, "large");
    }

    #[test]
    fn test_falls_back_to_default() {
        let opt = TokenOptimizer::new(vec![], "fallback");
        let result = opt.optimize("anything", &OptimizeHints::default());
        assert_eq!(result.selected_model, "fallback");
        assert_eq!(result.strategy, "default");
    }

    #[test]
    fn test_record_and_stats() {
        let opt = TokenOptimizer::new(tiers(), "fallback");
        opt.record_actual("p1", 100, 110, "small");
        opt.record_actual("p1", 100, 90, "small");
        opt.record_actual("p2", 50, 50, "large");

        let stats = opt.stats();
        assert_eq!(stats.samples, 3);
        // abs errors: 10 + 10 + 0 over 3 samples
        assert!((stats.mean_abs_error - 20.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.per_model["small"], 2);
        assert_eq!(stats.per_model["large"], 1);
    }

    #[test]
    fn test_pattern_key_deterministic() {
        assert_eq!(pattern_key("m", "same"), pattern_key("m", "same"));
        assert_ne!(pattern_key("m", "a"), pattern_key("m", "b"));
        assert!(!pattern_key("model/x", "a").contains('/'));
    }

    #[test]
    fn test_history_persistence() {
        let dir = tempfile::tempdir().unwrap();
        let opt =
            TokenOptimizer::new(tiers(), "fallback").with_history_dir(dir.path().to_path_buf());
        opt.record_actual("p1", 100, 90, "small");
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_maintenance_compacts() {
        let mut opt = TokenOptimizer::new(tiers(), "fallback");
        opt.max_patterns_per_model = 2;
        for i in 0..5 {
            // Distinct problems, varying sample counts
            for _ in 0..=i {
                opt.record_actual(&format!("p{}", i), 10, 10, "small");
            }
        }
        let removed = opt.maintenance();
        assert_eq!(removed, 3);
        assert_eq!(opt.patterns.lock().len(), 2);
    }
}
