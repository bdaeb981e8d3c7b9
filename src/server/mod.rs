//! Line-delimited JSON-RPC server over stdio.
//!
//! [`ServerContext`] wires the full service graph from [`Settings`];
//! [`Server`] reads one JSON-RPC request per line from stdin and writes
//! one response per line to stdout. Methods: `initialize`, `tools/list`,
//! `tools/call`, `resources/list`, `resources/templates/list`,
//! `resources/read`.

pub mod protocol;
pub mod resources;
pub mod tools;

use crate::cache::{CacheConfig, CacheLayer};
use crate::config::Settings;
use crate::dispatch::{DispatcherConfig, FallbackDispatcher, ProviderDescriptor};
use crate::error::{ProcessorError, Result};
use crate::health::HealthMonitor;
use crate::memory::{HashEmbedder, MemoryStore};
use crate::pipeline::PipelineOrchestrator;
use crate::provider::{HttpProviderClient, ProviderClient};
use crate::queue::{QueueConfig, QueuedProviderClient};
use crate::registry::ServiceRegistry;
use crate::thinking::{EngineConfig, ThinkingEngine};
use crate::tokens::{ModelTier, TokenOptimizer};
use protocol::{JsonRpcRequest, JsonRpcResponse};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// Server name reported by `initialize`.
const SERVER_NAME: &str = "cognitive-processor";

/// The wired service graph shared by every request.
pub struct ServerContext {
    /// Loaded settings.
    pub settings: Settings,
    /// Singleton registry; owns shutdown order.
    pub registry: Arc<ServiceRegistry>,
    /// Provider fallback dispatcher.
    pub dispatcher: Arc<FallbackDispatcher>,
    /// Two-tier artifact cache.
    pub cache: Arc<CacheLayer>,
    /// Typed memory store.
    pub memory: Arc<MemoryStore>,
    /// Token optimizer.
    pub optimizer: Arc<TokenOptimizer>,
    /// Thinking engine.
    pub engine: Arc<ThinkingEngine>,
    /// Pipeline orchestrator.
    pub orchestrator: Arc<PipelineOrchestrator>,
    /// Health monitor.
    pub health: Arc<HealthMonitor>,
}

impl ServerContext {
    /// Wire the graph from settings, constructing provider clients from
    /// the settings' provider list.
    pub fn from_settings(settings: Settings) -> Result<Self> {
        let health = Arc::new(HealthMonitor::new());
        let dispatcher = Arc::new(
            FallbackDispatcher::new(DispatcherConfig::default())
                .with_events(Arc::clone(&health) as Arc<dyn crate::events::EventHandler>),
        );

        let queue_config = QueueConfig {
            max_concurrent: settings.queue.max_concurrent,
            rate_limit_delay: Duration::from_millis(settings.queue.rate_limit_delay_ms),
            request_timeout: Duration::from_millis(settings.queue.request_timeout_ms),
            max_retries: settings.queue.max_retries,
            ..QueueConfig::default()
        };
        for provider in &settings.providers {
            let mut client = HttpProviderClient::new(&provider.name, &provider.base_url);
            if let Some(key) = Settings::provider_api_key(provider) {
                client = client.with_api_key(key);
            }
            // Each provider sits behind its own FIFO queue.
            let queued = QueuedProviderClient::new(
                Arc::new(client) as Arc<dyn ProviderClient>,
                queue_config.clone(),
            );
            dispatcher.register(ProviderDescriptor {
                name: provider.name.clone(),
                priority: provider.priority,
                weight: provider.weight,
                max_timeout: Duration::from_millis(provider.max_timeout_ms),
                client: Arc::new(queued) as Arc<dyn ProviderClient>,
            });
        }
        if settings.providers.is_empty() {
            tracing::warn!("no providers configured; generation tools will fail");
        }

        Self::build(settings, dispatcher, health)
    }

    /// Wire the graph around a prepared dispatcher (used by tests with
    /// mock providers).
    pub fn build(
        settings: Settings,
        dispatcher: Arc<FallbackDispatcher>,
        health: Arc<HealthMonitor>,
    ) -> Result<Self> {
        let data_dir = settings.data_dir.clone();

        let mut cache_config = CacheConfig {
            max_entries: settings.cache.max_entries,
            ..CacheConfig::default()
        };
        for (cache_type, hours) in &settings.cache.ttl_hours_by_type {
            cache_config
                .ttl_by_type
                .insert(cache_type.clone(), Duration::from_secs(hours * 3600));
        }
        let cache = Arc::new(
            CacheLayer::new(cache_config, data_dir.join("cache")).with_health(Arc::clone(&health)),
        );

        let memory = Arc::new(MemoryStore::open(
            Arc::new(HashEmbedder::default()),
            data_dir.clone(),
        )?);

        let tiers: Vec<ModelTier> = settings.tokens.tiers.clone();
        let default_model = settings
            .tokens
            .default_model
            .clone()
            .unwrap_or_else(|| settings.default_llm_model.clone());
        let optimizer = Arc::new(
            TokenOptimizer::new(tiers, default_model)
                .with_history_dir(data_dir.join("token_history")),
        );

        let engine_config = EngineConfig {
            default_thinking_model: settings.default_thinking_model.clone(),
            llm_model: settings.default_llm_model.clone(),
            ..EngineConfig::default()
        };
        let engine = Arc::new(
            ThinkingEngine::new(Arc::clone(&dispatcher), Arc::clone(&cache), engine_config)
                .with_memory(Arc::clone(&memory))
                .with_optimizer(Arc::clone(&optimizer))
                .with_history_dir(data_dir.join("thinking")),
        );

        let orchestrator = Arc::new(PipelineOrchestrator::new(Arc::clone(&dispatcher)));

        let registry = Arc::new(ServiceRegistry::new());
        registry.register("health", Arc::clone(&health));
        registry.register("dispatcher", Arc::clone(&dispatcher));
        registry.register("cache", Arc::clone(&cache));
        registry.register("memory", Arc::clone(&memory));
        registry.register("optimizer", Arc::clone(&optimizer));
        registry.register("engine", Arc::clone(&engine));
        registry.register("orchestrator", Arc::clone(&orchestrator));

        {
            let dispatcher = Arc::clone(&dispatcher);
            registry.on_shutdown("dispatcher", move || dispatcher.shutdown());
        }
        {
            let health = Arc::clone(&health);
            let metrics_dir = data_dir.join("metrics");
            registry.on_shutdown("health", move || {
                if let Err(e) = health.persist_snapshot(&metrics_dir) {
                    tracing::warn!(error = %e, "final metrics snapshot failed");
                }
            });
        }

        Ok(Self {
            settings,
            registry,
            dispatcher,
            cache,
            memory,
            optimizer,
            engine,
            orchestrator,
            health,
        })
    }
}

/// The stdio JSON-RPC server.
pub struct Server {
    ctx: Arc<ServerContext>,
}

impl Server {
    /// Wrap a wired context.
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self { ctx }
    }

    /// The wired context.
    pub fn context(&self) -> &ServerContext {
        &self.ctx
    }

    /// Handle one request line. Returns `None` for notifications.
    pub async fn handle_line(&self, line: &str) -> Option<String> {
        let request: JsonRpcRequest = match serde_json::from_str(line) {
            Ok(req) => req,
            Err(e) => {
                let resp = JsonRpcResponse::error(
                    Value::Null,
                    protocol::PARSE_ERROR,
                    format!("parse error: {}", e),
                    None,
                );
                return serde_json::to_string(&resp).ok();
            }
        };

        if request.method.starts_with("notifications/") {
            return None;
        }
        let id = request.id.clone().unwrap_or(Value::Null);
        let response = self.handle_request(id, request).await;
        serde_json::to_string(&response).ok()
    }

    async fn handle_request(&self, id: Value, request: JsonRpcRequest) -> JsonRpcResponse {
        tracing::debug!(method = %request.method, "handling request");
        match request.method.as_str() {
            "initialize" => JsonRpcResponse::success(
                id,
                json!({
                    "protocolVersion": "2024-11-05",
                    "serverInfo": {
                        "name": SERVER_NAME,
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                    "capabilities": {
                        "tools": {},
                        "resources": {},
                    },
                }),
            ),

            "tools/list" => {
                let tools: Vec<Value> = tools::descriptors().iter().map(|d| d.to_json()).collect();
                JsonRpcResponse::success(id, json!({"tools": tools}))
            }

            "tools/call" => {
                let params = request.params.unwrap_or(Value::Null);
                let Some(name) = params.get("name").and_then(Value::as_str) else {
                    return JsonRpcResponse::error(
                        id,
                        protocol::INVALID_PARAMS,
                        "params.name is required",
                        None,
                    );
                };
                let arguments = params
                    .get("arguments")
                    .cloned()
                    .unwrap_or_else(|| json!({}));

                match self.call_tool(name, &arguments).await {
                    Ok(result) => JsonRpcResponse::success(
                        id,
                        json!({
                            "content": [{"type": "text", "text": result.to_string()}],
                        }),
                    ),
                    Err(e) => JsonRpcResponse::from_processor_error(id, &e),
                }
            }

            "resources/list" => JsonRpcResponse::success(id, resources::list()),
            "resources/templates/list" => JsonRpcResponse::success(id, resources::templates()),

            "resources/read" => {
                let uri = request
                    .params
                    .as_ref()
                    .and_then(|p| p.get("uri"))
                    .and_then(Value::as_str);
                match uri {
                    Some(uri) => match resources::read(&self.ctx, uri) {
                        Ok(result) => JsonRpcResponse::success(id, result),
                        Err(e) => JsonRpcResponse::from_processor_error(id, &e),
                    },
                    None => JsonRpcResponse::error(
                        id,
                        protocol::INVALID_PARAMS,
                        "params.uri is required",
                        None,
                    ),
                }
            }

            other => JsonRpcResponse::error(
                id,
                protocol::METHOD_NOT_FOUND,
                format!("method '{}' not found", other),
                None,
            ),
        }
    }

    /// Validate against the tool's schema, then dispatch.
    async fn call_tool(&self, name: &str, arguments: &Value) -> Result<Value> {
        let descriptor = tools::descriptors()
            .into_iter()
            .find(|d| d.name == name)
            .ok_or_else(|| {
                ProcessorError::invalid_input(
                    format!("unknown tool '{}'", name),
                    &["see tools/list for the available tools"],
                )
            })?;
        tools::validate(&descriptor.input_schema, arguments)?;
        tools::call(&self.ctx, name, arguments).await
    }

    /// Serve until stdin closes.
    pub async fn run(&self) -> Result<()> {
        let stdin = tokio::io::stdin();
        let mut stdout = tokio::io::stdout();
        let mut lines = BufReader::new(stdin).lines();

        tracing::info!(server = SERVER_NAME, "serving on stdio");
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            if let Some(response) = self.handle_line(&line).await {
                stdout.write_all(response.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
        }
        tracing::info!("stdin closed; shutting down");
        self.ctx.registry.shutdown();
        Ok(())
    }
}
