//! Provider client for OpenAI-compatible APIs.
//!
//! [`HttpProviderClient`] covers: OpenAI, Anthropic (compat layer), vLLM,
//! llama.cpp server, LM Studio, Together AI, Groq, Mistral, Fireworks,
//! and Ollama's `/v1/` endpoint.
//!
//! Endpoint: `/v1/chat/completions` (always chat mode). Probe endpoint:
//! `/v1/models`.

use super::{new_instance_id, LlmRequest, LlmResponse, ProviderClient, TokenUsage};
use crate::error::{ProcessorError, Result};
use crate::events::{emit, Event, EventHandler};
use crate::tokens::estimate_tokens;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;

/// Provider client for any OpenAI-compatible API.
///
/// # Example
///
/// ```
/// use cognitive_processor::provider::HttpProviderClient;
///
/// let client = HttpProviderClient::new("openai", "https://api.openai.com")
///     .with_api_key("sk-...");
/// ```
#[derive(Clone)]
pub struct HttpProviderClient {
    name: String,
    instance_id: String,
    base_url: String,
    client: Client,
    /// Optional API key. If set, sent as `Authorization: Bearer {key}`.
    api_key: Option<String>,
    /// Optional per-call event sink (health monitor, logging).
    events: Option<Arc<dyn EventHandler>>,
}

impl std::fmt::Debug for HttpProviderClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProviderClient")
            .field("name", &self.name)
            .field("instance_id", &self.instance_id)
            .field("base_url", &self.base_url)
            .field(
                "api_key",
                &self.api_key.as_ref().map(|k| {
                    if k.len() > 6 {
                        format!("{}***", &k[..6])
                    } else {
                        "***".to_string()
                    }
                }),
            )
            .finish()
    }
}

impl HttpProviderClient {
    /// Create a client for the given provider name and base URL.
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        let name = name.into();
        let instance_id = new_instance_id(&name);
        Self {
            name,
            instance_id,
            base_url: normalize_base_url(&base_url.into()),
            client: Client::new(),
            api_key: None,
            events: None,
        }
    }

    /// Set the API key for authentication.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Use a pre-built HTTP client (custom timeouts, proxies).
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    /// Attach an event sink receiving a record per call.
    pub fn with_events(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the request body for `/v1/chat/completions`.
    fn build_body(request: &LlmRequest) -> Value {
        let messages: Vec<Value> = request
            .effective_messages()
            .into_iter()
            .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
            .collect();
        json!({
            "model": request.model,
            "messages": messages,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream": false,
        })
    }

    /// Parse a `Retry-After` header value as seconds.
    fn parse_retry_after(value: &str) -> Option<std::time::Duration> {
        value
            .trim()
            .parse::<u64>()
            .ok()
            .map(std::time::Duration::from_secs)
    }

    /// Classify a non-success status into the error taxonomy.
    fn classify_status(
        &self,
        status: u16,
        body: String,
        retry_after: Option<std::time::Duration>,
    ) -> ProcessorError {
        match status {
            401 | 403 => ProcessorError::Auth {
                provider: self.name.clone(),
            },
            429 => ProcessorError::RateLimited {
                provider: self.name.clone(),
                retry_after,
            },
            _ => ProcessorError::Http { status, body },
        }
    }

    /// Pull token usage out of the response, estimating when absent.
    fn extract_usage(&self, json_resp: &Value, request: &LlmRequest, text: &str) -> TokenUsage {
        let usage = json_resp.get("usage");
        let prompt = usage
            .and_then(|u| u.get("prompt_tokens"))
            .and_then(Value::as_u64);
        let completion = usage
            .and_then(|u| u.get("completion_tokens"))
            .and_then(Value::as_u64);
        match (prompt, completion) {
            (Some(p), Some(c)) => TokenUsage::new(p as u32, c as u32),
            _ => TokenUsage::new(
                estimate_tokens(&request.flattened_text()),
                estimate_tokens(text),
            ),
        }
    }

    fn record_outcome(&self, outcome: &Result<LlmResponse>) {
        match outcome {
            Ok(resp) => emit(
                &self.events,
                Event::QuerySuccess {
                    provider: self.name.clone(),
                    latency_ms: resp.latency_ms,
                    tokens: resp.usage.total,
                },
            ),
            Err(e) => emit(
                &self.events,
                Event::QueryError {
                    provider: self.name.clone(),
                    class: e.class(),
                    retryable: e.is_retryable(),
                },
            ),
        }
    }

    async fn query_inner(&self, request: &LlmRequest) -> Result<LlmResponse> {
        request.validate()?;
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = Self::build_body(request);
        let start = Instant::now();

        let mut req = self.client.post(&url).json(&body);
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }

        let resp = req.send().await?;
        let status = resp.status().as_u16();

        if !resp.status().is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(Self::parse_retry_after);
            let text = resp.text().await.unwrap_or_default();
            return Err(self.classify_status(status, text, retry_after));
        }

        let raw = resp.text().await?;
        let json_resp: Value = serde_json::from_str(&raw).map_err(|_| ProcessorError::Content {
            provider: self.name.clone(),
            detail: format!("non-JSON body ({} bytes)", raw.len()),
        })?;

        let text = json_resp
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        if text.is_empty() {
            return Err(ProcessorError::Content {
                provider: self.name.clone(),
                detail: "response contained no text content".into(),
            });
        }

        let usage = self.extract_usage(&json_resp, request, &text);
        let model = json_resp
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(&request.model)
            .to_string();

        Ok(LlmResponse {
            text,
            model,
            usage,
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn query(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let outcome = self.query_inner(request).await;
        self.record_outcome(&outcome);
        outcome
    }

    async fn probe(&self) -> Result<()> {
        let url = format!("{}/v1/models", self.base_url);
        let mut req = self.client.get(&url);
        if let Some(ref key) = self.api_key {
            req = req.header("Authorization", format!("Bearer {}", key));
        }
        let resp = req.send().await?;
        let status = resp.status().as_u16();
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(self.classify_status(status, String::new(), None))
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn instance_id(&self) -> &str {
        &self.instance_id
    }
}

/// Strip known provider path suffixes from a base URL.
/// Prevents double-pathing when the client appends its own paths,
/// e.g. "https://api.openai.com/v1" -> "https://api.openai.com".
fn normalize_base_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    for suffix in &["/v1/chat/completions", "/v1/chat", "/v1"] {
        if let Some(stripped) = trimmed.strip_suffix(suffix) {
            return stripped.to_string();
        }
    }
    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Role;

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(
            normalize_base_url("https://api.openai.com/v1"),
            "https://api.openai.com"
        );
        assert_eq!(
            normalize_base_url("https://api.openai.com/v1/chat/completions"),
            "https://api.openai.com"
        );
        assert_eq!(
            normalize_base_url("http://localhost:8080/"),
            "http://localhost:8080"
        );
    }

    #[test]
    fn test_build_body_shape() {
        let req = LlmRequest::prompt("m1", "hi").with_system_prompt("sys");
        let body = HttpProviderClient::build_body(&req);
        assert_eq!(body["model"], "m1");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["stream"], false);
    }

    #[test]
    fn test_classify_statuses() {
        let client = HttpProviderClient::new("p", "http://x");
        assert!(matches!(
            client.classify_status(401, String::new(), None),
            ProcessorError::Auth { .. }
        ));
        assert!(matches!(
            client.classify_status(429, String::new(), None),
            ProcessorError::RateLimited { .. }
        ));
        assert!(matches!(
            client.classify_status(500, String::new(), None),
            ProcessorError::Http { status: 500, .. }
        ));
    }

    #[test]
    fn test_extract_usage_falls_back_to_estimate() {
        let client = HttpProviderClient::new("p", "http://x");
        let req = LlmRequest::prompt("m", "four words of prompt");
        let usage = client.extract_usage(&json!({}), &req, "two words");
        assert!(usage.prompt > 0);
        assert!(usage.completion > 0);
        assert_eq!(usage.total, usage.prompt + usage.completion);
    }

    #[test]
    fn test_extract_usage_prefers_provider_counts() {
        let client = HttpProviderClient::new("p", "http://x");
        let req = LlmRequest::prompt("m", "hi");
        let resp = json!({"usage": {"prompt_tokens": 7, "completion_tokens": 3}});
        let usage = client.extract_usage(&resp, &req, "out");
        assert_eq!(usage, TokenUsage::new(7, 3));
    }

    #[test]
    fn test_unique_instance_ids() {
        let a = HttpProviderClient::new("p", "http://x");
        let b = HttpProviderClient::new("p", "http://x");
        assert_ne!(a.instance_id(), b.instance_id());
    }

    #[test]
    fn test_chat_messages_serialized_in_order() {
        let req = LlmRequest::chat(
            "m",
            vec![
                crate::provider::ChatMessage::user("q1"),
                crate::provider::ChatMessage::assistant("a1"),
                crate::provider::ChatMessage {
                    role: Role::User,
                    content: "q2".into(),
                },
            ],
        );
        let body = HttpProviderClient::build_body(&req);
        let msgs = body["messages"].as_array().unwrap();
        assert_eq!(msgs.len(), 3);
        assert_eq!(msgs[2]["content"], "q2");
    }
}
