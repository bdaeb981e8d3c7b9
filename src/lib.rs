//! # Cognitive Processor
//!
//! Cognitive-processing middleware: accepts a natural-language problem
//! and returns a structured, multi-step reasoning artifact. Heterogeneous
//! LLM providers are coordinated through a staged pipeline with
//! per-stage isolation, a two-tier artifact cache, a typed associative
//! memory with hybrid retrieval, and token-usage optimization. Clients
//! speak line-delimited JSON-RPC over stdio.
//!
//! ## Core Concepts
//!
//! - **[`ProviderClient`]** — uniform contract to one LLM endpoint;
//!   [`HttpProviderClient`] for OpenAI-compatible APIs, [`MockProvider`]
//!   for tests.
//! - **[`FallbackDispatcher`]** — ranks providers by priority, success
//!   rate, and weight; retries across them in rounds.
//! - **[`RequestQueue`]** — per-provider FIFO with bounded concurrency,
//!   deadlines, and backoff retry.
//! - **[`CacheLayer`]** — memory + disk tiers with TTL, gzip envelopes,
//!   and pluggable eviction.
//! - **[`MemoryStore`]** — typed, connected items with hybrid
//!   vector/lexical retrieval.
//! - **[`ThinkingEngine`]** — drives a strategy's step sequence into a
//!   [`ThinkingProcess`] artifact.
//! - **[`PipelineOrchestrator`]** — strictly sequential stages threaded
//!   by an [`InterStageToken`].
//!
//! ## Quick Start
//!
//! ```no_run
//! use cognitive_processor::config::Settings;
//! use cognitive_processor::server::{Server, ServerContext};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (settings, _writeback) = Settings::load(None)?;
//!     let ctx = Arc::new(ServerContext::from_settings(settings)?);
//!     Server::new(ctx).run().await?;
//!     Ok(())
//! }
//! ```
//!
//! Individual subsystems compose without the server:
//!
//! ```
//! use cognitive_processor::memory::{HashEmbedder, MemoryKind, MemoryStore};
//! use std::collections::BTreeSet;
//! use std::sync::Arc;
//!
//! let memory = MemoryStore::in_memory(Arc::new(HashEmbedder::default()));
//! let id = memory
//!     .store(MemoryKind::Semantic, "quicksort is O(n log n)", 0.8, BTreeSet::new())
//!     .unwrap();
//! let hits = memory.retrieve("quicksort is O(n log n)", 1);
//! assert_eq!(hits[0].item.id, id);
//! ```

pub mod cache;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod health;
pub mod memory;
pub mod pipeline;
pub mod prompt;
pub mod provider;
pub mod queue;
pub mod registry;
pub mod server;
pub mod thinking;
pub mod tokens;

pub use cache::{CacheConfig, CacheLayer, EvictionPolicy};
pub use dispatch::{DispatcherConfig, FallbackDispatcher, ProviderDescriptor, ProviderStats};
pub use error::{ProcessorError, Result};
pub use events::{Event, EventHandler, FnEventHandler};
pub use health::{HealthMonitor, OverallStatus, ServiceStatus};
pub use memory::{MemoryItem, MemoryKind, MemoryStore};
pub use pipeline::{InterStageToken, PipelineOrchestrator, PipelineStage};
pub use provider::{
    ChatMessage, HttpProviderClient, LlmRequest, LlmResponse, MockProvider, ProviderClient, Role,
    TokenUsage,
};
pub use queue::{QueueConfig, QueuedProviderClient, RequestQueue, SubmitPolicy};
pub use registry::ServiceRegistry;
pub use thinking::{ProcessStatus, StepStatus, ThinkingEngine, ThinkingProcess, ThinkingStep};
pub use tokens::TokenOptimizer;
