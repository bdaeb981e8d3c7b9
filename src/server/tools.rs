//! Tool descriptors, argument validation, and dispatch.
//!
//! Every tool declares a JSON Schema for its arguments; `tools/call`
//! validates against it before touching any service, so malformed calls
//! never reach providers or caches.

use super::ServerContext;
use crate::error::{ProcessorError, Result};
use crate::memory::MemoryKind;
use crate::pipeline::PipelineStage;
use crate::provider::LlmRequest;
use crate::thinking::ThinkingOptions;
use crate::tokens::OptimizeHints;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::time::Duration;

/// One tool's advertised contract.
#[derive(Debug, Clone)]
pub struct ToolDescriptor {
    /// Tool name.
    pub name: &'static str,
    /// Human-readable description.
    pub description: &'static str,
    /// JSON Schema of the arguments object.
    pub input_schema: Value,
}

impl ToolDescriptor {
    /// Wire representation for `tools/list`.
    pub fn to_json(&self) -> Value {
        json!({
            "name": self.name,
            "description": self.description,
            "inputSchema": self.input_schema,
        })
    }
}

/// All advertised tools.
pub fn descriptors() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor {
            name: "thinking_process",
            description: "Run a structured multi-step reasoning process over a problem.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "problem": {"type": "string"},
                    "thinking_model": {"type": "string"},
                    "include_visualization": {"type": "boolean"},
                    "optimize_tokens": {"type": "boolean"},
                },
                "required": ["problem"],
            }),
        },
        ToolDescriptor {
            name: "generate_with_mcp",
            description: "Generate text through the provider fallback chain.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "prompt": {"type": "string"},
                    "model": {"type": "string"},
                    "max_tokens": {"type": "integer"},
                    "optimize_tokens": {"type": "boolean"},
                },
                "required": ["prompt"],
            }),
        },
        ToolDescriptor {
            name: "reasoning_pipeline",
            description: "Run a configured multi-stage reasoning pipeline over a query.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "system": {"type": "string"},
                },
                "required": ["query"],
            }),
        },
        ToolDescriptor {
            name: "store_memory",
            description: "Store a typed memory item.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "type": {"type": "string"},
                    "content": {"type": "string"},
                    "importance": {"type": "number"},
                    "connections": {"type": "array"},
                },
                "required": ["type", "content"],
            }),
        },
        ToolDescriptor {
            name: "retrieve_memory",
            description: "Retrieve memory items ranked by hybrid relevance.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "limit": {"type": "integer"},
                },
                "required": ["query"],
            }),
        },
        ToolDescriptor {
            name: "check_cache",
            description: "Look up a cached value by type and key.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "cache_type": {"type": "string"},
                    "key": {"type": "string"},
                },
                "required": ["cache_type", "key"],
            }),
        },
        ToolDescriptor {
            name: "store_cache",
            description: "Store a value in the cache.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "cache_type": {"type": "string"},
                    "key": {"type": "string"},
                    "value": {},
                    "ttl_seconds": {"type": "integer"},
                },
                "required": ["cache_type", "key", "value"],
            }),
        },
        ToolDescriptor {
            name: "perform_maintenance",
            description: "Run maintenance for the named subsystems.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "systems": {"type": "array"},
                },
                "required": ["systems"],
            }),
        },
        ToolDescriptor {
            name: "estimate_token_count",
            description: "Estimate the token count of a text.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "text": {"type": "string"},
                },
                "required": ["text"],
            }),
        },
        ToolDescriptor {
            name: "update_token_metrics",
            description: "Record an estimate-vs-actual token observation.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "problem_id": {"type": "string"},
                    "estimated": {"type": "integer"},
                    "actual": {"type": "integer"},
                    "model": {"type": "string"},
                },
                "required": ["problem_id", "estimated", "actual", "model"],
            }),
        },
        ToolDescriptor {
            name: "get_token_optimization_stats",
            description: "Aggregate token-estimation accuracy metrics.",
            input_schema: json!({
                "type": "object",
                "properties": {},
            }),
        },
    ]
}

/// Validate `args` against a (single-level) object schema: required
/// keys present, declared property types respected.
pub fn validate(schema: &Value, args: &Value) -> Result<()> {
    let Some(args_obj) = args.as_object() else {
        return Err(ProcessorError::invalid_input(
            "arguments must be an object",
            &["pass tool arguments as a JSON object"],
        ));
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !args_obj.contains_key(key) {
                return Err(ProcessorError::invalid_input(
                    format!("missing required argument '{}'", key),
                    &["compare against the tool's inputSchema from tools/list"],
                ));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (key, value) in args_obj {
            let Some(expected) = properties.get(key).and_then(|p| p.get("type")) else {
                continue;
            };
            let matches = match expected.as_str() {
                Some("string") => value.is_string(),
                Some("boolean") => value.is_boolean(),
                Some("integer") => value.is_i64() || value.is_u64(),
                Some("number") => value.is_number(),
                Some("array") => value.is_array(),
                Some("object") => value.is_object(),
                _ => true,
            };
            if !matches {
                return Err(ProcessorError::invalid_input(
                    format!("argument '{}' has the wrong type", key),
                    &["compare against the tool's inputSchema from tools/list"],
                ));
            }
        }
    }
    Ok(())
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ProcessorError::invalid_input(format!("'{}' must be a string", key), &[]))
}

/// Execute one validated tool call.
pub async fn call(ctx: &ServerContext, name: &str, args: &Value) -> Result<Value> {
    match name {
        "thinking_process" => {
            let options = ThinkingOptions {
                thinking_model: args
                    .get("thinking_model")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                include_visualization: args
                    .get("include_visualization")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                optimize_tokens: args
                    .get("optimize_tokens")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
                cancel: None,
            };
            let process = ctx.engine.process(required_str(args, "problem")?, options).await?;
            Ok(serde_json::to_value(process)?)
        }

        "generate_with_mcp" => {
            let prompt = required_str(args, "prompt")?;
            let optimize = args
                .get("optimize_tokens")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let hints = OptimizeHints {
                user_model: args.get("model").and_then(Value::as_str).map(str::to_string),
                available_tokens: args
                    .get("max_tokens")
                    .and_then(Value::as_u64)
                    .map(|v| v as u32),
            };

            let optimization = if optimize {
                Some(ctx.optimizer.optimize(prompt, &hints))
            } else {
                None
            };
            let model = optimization
                .as_ref()
                .map(|o| o.selected_model.clone())
                .or(hints.user_model)
                .unwrap_or_else(|| ctx.settings.default_llm_model.clone());

            let mut request = LlmRequest::prompt(model, prompt);
            if let Some(max_tokens) = args.get("max_tokens").and_then(Value::as_u64) {
                request = request.with_max_tokens(max_tokens as u32);
            }
            let response = ctx.dispatcher.dispatch(&request).await?;
            Ok(json!({
                "text": response.text,
                "model": response.model,
                "token_usage": response.usage,
                "latency_ms": response.latency_ms,
                "optimization": optimization,
            }))
        }

        "reasoning_pipeline" => {
            let query = required_str(args, "query")?;
            let system_name = args.get("system").and_then(Value::as_str);
            let system = match system_name {
                Some(name) => ctx
                    .settings
                    .reasoning_systems
                    .iter()
                    .find(|s| s.name == name)
                    .ok_or_else(|| {
                        ProcessorError::invalid_input(
                            format!("unknown reasoning system '{}'", name),
                            &["see mcp://config/reasoning-systems for the available systems"],
                        )
                    })?,
                None => ctx.settings.reasoning_systems.first().ok_or_else(|| {
                    ProcessorError::invalid_input("no reasoning systems configured", &[])
                })?,
            };
            let stages: Vec<PipelineStage> = system
                .stages
                .iter()
                .map(|stage_name| {
                    PipelineStage::new(
                        stage_name.clone(),
                        format!("You perform the '{}' stage of the analysis.", stage_name),
                    )
                    .with_model(ctx.settings.default_llm_model.clone())
                })
                .collect();
            let result = ctx.orchestrator.run(&stages, query).await?;
            Ok(serde_json::to_value(result)?)
        }

        "store_memory" => {
            let kind_str = required_str(args, "type")?;
            let kind = MemoryKind::parse(kind_str).ok_or_else(|| {
                ProcessorError::invalid_input(
                    format!("unknown memory type '{}'", kind_str),
                    &["use one of: working, episodic, semantic, procedural"],
                )
            })?;
            let content = required_str(args, "content")?;
            let importance = args
                .get("importance")
                .and_then(Value::as_f64)
                .unwrap_or(0.5);
            let connections: BTreeSet<String> = args
                .get("connections")
                .and_then(Value::as_array)
                .map(|list| {
                    list.iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            let id = ctx.memory.store(kind, content, importance, connections)?;
            Ok(json!({"id": id}))
        }

        "retrieve_memory" => {
            let query = required_str(args, "query")?;
            let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(5) as usize;
            let results = ctx.memory.retrieve(query, limit);
            Ok(json!({"items": results}))
        }

        "check_cache" => {
            let cache_type = required_str(args, "cache_type")?;
            let key = required_str(args, "key")?;
            match ctx.cache.get(cache_type, key) {
                Some(value) => Ok(json!({"hit": true, "value": value})),
                None => Ok(json!({"hit": false})),
            }
        }

        "store_cache" => {
            let cache_type = required_str(args, "cache_type")?;
            let key = required_str(args, "key")?;
            let value = args
                .get("value")
                .cloned()
                .ok_or_else(|| ProcessorError::invalid_input("'value' is required", &[]))?;
            let ttl = args
                .get("ttl_seconds")
                .and_then(Value::as_u64)
                .map(Duration::from_secs);
            ctx.cache.set(cache_type, key, value, ttl)?;
            Ok(json!({"stored": true}))
        }

        "perform_maintenance" => {
            let systems: Vec<&str> = args
                .get("systems")
                .and_then(Value::as_array)
                .map(|list| list.iter().filter_map(Value::as_str).collect())
                .unwrap_or_default();
            if systems.is_empty() {
                return Err(ProcessorError::invalid_input(
                    "'systems' must name at least one subsystem",
                    &["use any of: cache, memory, thinking, optimization, all"],
                ));
            }
            let all = systems.contains(&"all");
            let mut cleaned = serde_json::Map::new();
            if all || systems.contains(&"cache") {
                cleaned.insert("cache".into(), json!(ctx.cache.maintenance()));
            }
            if all || systems.contains(&"memory") {
                cleaned.insert("memory".into(), json!(ctx.memory.maintenance()));
            }
            if all || systems.contains(&"thinking") {
                cleaned.insert("thinking".into(), json!(ctx.engine.maintenance()));
            }
            if all || systems.contains(&"optimization") {
                cleaned.insert("optimization".into(), json!(ctx.optimizer.maintenance()));
            }
            if cleaned.is_empty() {
                return Err(ProcessorError::invalid_input(
                    "no recognized subsystem named",
                    &["use any of: cache, memory, thinking, optimization, all"],
                ));
            }
            Ok(Value::Object(cleaned))
        }

        "estimate_token_count" => {
            let text = required_str(args, "text")?;
            Ok(json!({"tokens": ctx.optimizer.estimate(text)}))
        }

        "update_token_metrics" => {
            let problem_id = required_str(args, "problem_id")?;
            let estimated = args
                .get("estimated")
                .and_then(Value::as_u64)
                .ok_or_else(|| ProcessorError::invalid_input("'estimated' must be an integer", &[]))?;
            let actual = args
                .get("actual")
                .and_then(Value::as_u64)
                .ok_or_else(|| ProcessorError::invalid_input("'actual' must be an integer", &[]))?;
            let model = required_str(args, "model")?;
            ctx.optimizer
                .record_actual(problem_id, estimated as u32, actual as u32, model);
            Ok(json!({"recorded": true}))
        }

        "get_token_optimization_stats" => Ok(serde_json::to_value(ctx.optimizer.stats())?),

        other => Err(ProcessorError::invalid_input(
            format!("unknown tool '{}'", other),
            &["see tools/list for the available tools"],
        )),
    }
}
