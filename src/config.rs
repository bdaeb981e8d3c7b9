//! Settings: file-backed configuration with environment overrides.
//!
//! Settings load from a JSON file at `config_path`. A missing file
//! yields in-memory defaults and disables writeback. Provider
//! credentials are never stored in the file; each provider names the
//! environment variable holding its key.

use crate::error::Result;
use crate::tokens::ModelTier;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One LLM provider endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Unique provider name.
    pub name: String,
    /// Base URL of the OpenAI-compatible endpoint.
    pub base_url: String,
    /// Dispatcher ranking priority.
    #[serde(default)]
    pub priority: i32,
    /// Dispatcher ranking weight.
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Per-attempt timeout in milliseconds.
    #[serde(default = "default_provider_timeout_ms")]
    pub max_timeout_ms: u64,
    /// Environment variable holding the API key, e.g. `OPENAI_API_KEY`.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

fn default_weight() -> f64 {
    1.0
}

fn default_provider_timeout_ms() -> u64 {
    30_000
}

/// A thinking model exposed through `mcp://config/thinking-models`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingModelSettings {
    /// Strategy name.
    pub name: String,
    /// Budget multiplier applied to step token limits.
    #[serde(default = "default_multiplier")]
    pub token_multiplier: f64,
    /// Short description for the config resource.
    #[serde(default)]
    pub description: String,
}

fn default_multiplier() -> f64 {
    1.0
}

/// A reasoning system exposed through `mcp://config/reasoning-systems`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReasoningSystemSettings {
    /// System name.
    pub name: String,
    /// Short description.
    #[serde(default)]
    pub description: String,
    /// Ordered stage names of the system's pipeline.
    #[serde(default)]
    pub stages: Vec<String>,
}

/// Cache tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Memory-tier entry bound.
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,
    /// TTL overrides per cache type, in hours.
    #[serde(default)]
    pub ttl_hours_by_type: std::collections::HashMap<String, u64>,
}

fn default_cache_entries() -> usize {
    1000
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: default_cache_entries(),
            ttl_hours_by_type: std::collections::HashMap::new(),
        }
    }
}

/// Queue tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// In-flight bound per provider.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Inter-dispatch spacing in milliseconds.
    #[serde(default = "default_rate_limit_ms")]
    pub rate_limit_delay_ms: u64,
    /// Per-item deadline in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Retry bound per item.
    #[serde(default = "default_queue_retries")]
    pub max_retries: u32,
}

fn default_max_concurrent() -> usize {
    3
}

fn default_rate_limit_ms() -> u64 {
    100
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_queue_retries() -> u32 {
    3
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            rate_limit_delay_ms: default_rate_limit_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            max_retries: default_queue_retries(),
        }
    }
}

/// Token-optimizer thresholds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenSettings {
    /// Model tier table, cheapest-first.
    #[serde(default)]
    pub tiers: Vec<ModelTier>,
    /// Model used when no tier fits.
    #[serde(default)]
    pub default_model: Option<String>,
}

/// Top-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Root of all persisted state.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Thinking model used when resolution falls through.
    #[serde(default = "default_thinking_model")]
    pub default_thinking_model: String,
    /// LLM model used when optimization is off.
    #[serde(default = "default_llm_model")]
    pub default_llm_model: String,
    /// Available thinking models.
    #[serde(default = "default_thinking_models")]
    pub thinking_models: Vec<ThinkingModelSettings>,
    /// Available reasoning systems.
    #[serde(default = "default_reasoning_systems")]
    pub reasoning_systems: Vec<ReasoningSystemSettings>,
    /// Registered providers.
    #[serde(default)]
    pub providers: Vec<ProviderSettings>,
    /// Cache knobs.
    #[serde(default)]
    pub cache: CacheSettings,
    /// Queue knobs.
    #[serde(default)]
    pub queue: QueueSettings,
    /// Token-optimizer knobs.
    #[serde(default)]
    pub tokens: TokenSettings,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_thinking_model() -> String {
    "chain_of_thought".to_string()
}

fn default_llm_model() -> String {
    "default-llm".to_string()
}

fn default_thinking_models() -> Vec<ThinkingModelSettings> {
    crate::thinking::strategy::KNOWN_MODELS
        .iter()
        .map(|name| ThinkingModelSettings {
            name: (*name).to_string(),
            token_multiplier: 1.0,
            description: String::new(),
        })
        .collect()
}

fn default_reasoning_systems() -> Vec<ReasoningSystemSettings> {
    vec![ReasoningSystemSettings {
        name: "three_stage_analysis".to_string(),
        description: "Extract, connect, conclude.".to_string(),
        stages: vec![
            "extract".to_string(),
            "connect".to_string(),
            "conclude".to_string(),
        ],
    }]
}

impl Default for Settings {
    fn default() -> Self {
        serde_json::from_str("{}").expect("defaults deserialize")
    }
}

impl Settings {
    /// Load settings from `path`.
    ///
    /// Returns the settings and whether writeback is enabled (`false`
    /// when the file was missing and defaults were used).
    pub fn load(path: Option<&Path>) -> Result<(Self, bool)> {
        match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read(path)?;
                let settings: Settings = serde_json::from_slice(&raw)?;
                Ok((settings, true))
            }
            Some(path) => {
                tracing::warn!(path = %path.display(), "settings file missing; using defaults, writeback disabled");
                Ok((Settings::default(), false))
            }
            None => Ok((Settings::default(), false)),
        }
    }

    /// Apply environment overrides: `DATA_DIR` replaces the data root.
    pub fn apply_env(&mut self) {
        if let Ok(dir) = std::env::var("DATA_DIR") {
            if !dir.is_empty() {
                self.data_dir = PathBuf::from(dir);
            }
        }
    }

    /// Resolve a provider's API key from its configured environment
    /// variable.
    pub fn provider_api_key(provider: &ProviderSettings) -> Option<String> {
        provider
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.is_empty())
    }

    /// Write the settings back to `path` as pretty JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }
}
