//! `mcp://` resource listing and reads.

use super::ServerContext;
use crate::error::{ProcessorError, Result};
use crate::memory::MemoryKind;
use serde_json::{json, Value};

/// Static resources advertised by `resources/list`.
pub fn list() -> Value {
    json!({
        "resources": [
            {
                "uri": "mcp://config/thinking-models",
                "name": "Thinking models",
                "description": "Available thinking models and their token multipliers.",
                "mimeType": "application/json",
            },
            {
                "uri": "mcp://config/reasoning-systems",
                "name": "Reasoning systems",
                "description": "Configured multi-stage reasoning systems.",
                "mimeType": "application/json",
            },
            {
                "uri": "mcp://memory/stats",
                "name": "Memory statistics",
                "description": "Item counts per memory type.",
                "mimeType": "application/json",
            },
            {
                "uri": "mcp://cache/stats",
                "name": "Cache statistics",
                "description": "Hit rates and sizes across cache tiers.",
                "mimeType": "application/json",
            },
        ]
    })
}

/// Parameterized resource templates.
pub fn templates() -> Value {
    json!({
        "resourceTemplates": [
            {
                "uriTemplate": "mcp://memory/{type}",
                "name": "Memory items by type",
                "mimeType": "application/json",
            },
            {
                "uriTemplate": "mcp://memory/item/{id}",
                "name": "A single memory item",
                "mimeType": "application/json",
            },
            {
                "uriTemplate": "mcp://cache/stats/{type}",
                "name": "Cache statistics for one type",
                "mimeType": "application/json",
            },
        ]
    })
}

/// Read one resource by URI.
pub fn read(ctx: &ServerContext, uri: &str) -> Result<Value> {
    let body = match uri {
        "mcp://config/thinking-models" => serde_json::to_value(&ctx.settings.thinking_models)?,
        "mcp://config/reasoning-systems" => serde_json::to_value(&ctx.settings.reasoning_systems)?,
        "mcp://memory/stats" => serde_json::to_value(ctx.memory.stats())?,
        "mcp://cache/stats" => serde_json::to_value(ctx.cache.stats())?,
        _ => {
            if let Some(id) = uri.strip_prefix("mcp://memory/item/") {
                let item = ctx.memory.get_by_id(id).ok_or_else(|| {
                    ProcessorError::invalid_input(
                        format!("no memory item '{}'", id),
                        &["list items via mcp://memory/{type}"],
                    )
                })?;
                serde_json::to_value(item)?
            } else if let Some(kind_str) = uri.strip_prefix("mcp://memory/") {
                let kind = MemoryKind::parse(kind_str).ok_or_else(|| {
                    ProcessorError::invalid_input(
                        format!("unknown memory type '{}'", kind_str),
                        &["use one of: working, episodic, semantic, procedural"],
                    )
                })?;
                serde_json::to_value(ctx.memory.get_by_type(kind))?
            } else if let Some(cache_type) = uri.strip_prefix("mcp://cache/stats/") {
                serde_json::to_value(ctx.cache.stats_for(cache_type))?
            } else {
                return Err(ProcessorError::invalid_input(
                    format!("unknown resource '{}'", uri),
                    &["see resources/list and resources/templates/list"],
                ));
            }
        }
    };

    Ok(json!({
        "contents": [{
            "uri": uri,
            "mimeType": "application/json",
            "text": body.to_string(),
        }]
    }))
}
