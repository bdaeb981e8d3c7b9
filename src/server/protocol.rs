//! JSON-RPC 2.0 wire types for the line-delimited stdio protocol.

use crate::error::ProcessorError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Parse error: the line was not valid JSON.
pub const PARSE_ERROR: i64 = -32700;
/// The request object was malformed.
pub const INVALID_REQUEST: i64 = -32600;
/// Unknown method.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Parameters failed validation.
pub const INVALID_PARAMS: i64 = -32602;
/// Unexpected internal failure.
pub const INTERNAL_ERROR: i64 = -32603;
/// Application: provider credential rejected.
pub const AUTH_ERROR: i64 = -32001;
/// Application: deadline elapsed.
pub const TIMEOUT_ERROR: i64 = -32002;
/// Application: queue at high-water mark.
pub const QUEUE_FULL_ERROR: i64 = -32003;
/// Application: every provider failed.
pub const ALL_PROVIDERS_FAILED_ERROR: i64 = -32004;
/// Application: cache rejected the operation.
pub const CACHE_ERROR: i64 = -32005;

/// Incoming request line.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    /// Protocol version; must be `"2.0"`.
    #[serde(default)]
    pub jsonrpc: String,
    /// Request id echoed in the response. Absent for notifications.
    #[serde(default)]
    pub id: Option<Value>,
    /// Method name (e.g. `tools/call`).
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Option<Value>,
}

/// Outgoing response line.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcResponse {
    /// Always `"2.0"`.
    pub jsonrpc: &'static str,
    /// Echoed request id (`null` when the request id was unreadable).
    pub id: Value,
    /// Result payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error payload on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

/// Error body of a response.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcError {
    /// JSON-RPC error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Structured details (the tool-boundary error object).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcResponse {
    /// Build a success response.
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response.
    pub fn error(id: Value, code: i64, message: impl Into<String>, data: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data,
            }),
        }
    }

    /// Map a processor error to a full error response.
    pub fn from_processor_error(id: Value, error: &ProcessorError) -> Self {
        Self::error(id, code_for(error), error.to_string(), Some(error_payload(error)))
    }
}

/// JSON-RPC code for a processor error.
pub fn code_for(error: &ProcessorError) -> i64 {
    match error {
        ProcessorError::InvalidInput { .. } => INVALID_PARAMS,
        ProcessorError::Auth { .. } => AUTH_ERROR,
        ProcessorError::Timeout(_) => TIMEOUT_ERROR,
        ProcessorError::QueueFull { .. } => QUEUE_FULL_ERROR,
        ProcessorError::AllProvidersFailed { .. } => ALL_PROVIDERS_FAILED_ERROR,
        ProcessorError::CacheTooLarge { .. } => CACHE_ERROR,
        _ => INTERNAL_ERROR,
    }
}

/// Structured error object surfaced at the tool boundary:
/// `{ message, type, timestamp, suggestions }` with at most three
/// suggestions.
pub fn error_payload(error: &ProcessorError) -> Value {
    let suggestions: Vec<String> = match error {
        ProcessorError::InvalidInput { suggestions, .. } => {
            suggestions.iter().take(3).cloned().collect()
        }
        ProcessorError::Auth { provider } => vec![format!(
            "check the API key environment variable for provider '{}'",
            provider
        )],
        ProcessorError::QueueFull { .. } => {
            vec!["retry after a short delay".to_string()]
        }
        ProcessorError::AllProvidersFailed { .. } => vec![
            "verify provider endpoints are reachable".to_string(),
            "check provider credentials".to_string(),
        ],
        _ => Vec::new(),
    };
    json!({
        "message": error.to_string(),
        "type": error.class(),
        "timestamp": Utc::now().to_rfc3339(),
        "suggestions": suggestions,
    })
}
