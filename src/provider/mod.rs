//! Provider client trait and normalized request/response types.
//!
//! The [`ProviderClient`] trait abstracts over LLM endpoints, translating
//! between normalized [`LlmRequest`]/[`LlmResponse`] types and
//! provider-specific HTTP APIs. Built-in implementations:
//! [`HttpProviderClient`] (OpenAI-compatible chat completions) and
//! [`MockProvider`] for tests.
//!
//! ## Architecture
//!
//! ```text
//! Dispatcher ──► LlmRequest ──► ProviderClient::query() ──► LlmResponse
//!                                        │
//!                             ┌──────────┴──────────┐
//!                       HttpProviderClient      MockProvider
//!                       /v1/chat/completions    canned responses
//! ```

pub mod http;
pub mod mock;

pub use http::HttpProviderClient;
pub use mock::{CallSpan, MockOutcome, MockProvider};

use crate::error::{ProcessorError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A normalized LLM request -- provider-agnostic.
///
/// Exactly one of `prompt` or `messages` is authoritative. When both are
/// present, `messages` wins. An optional `system_prompt` becomes the
/// leading message with role [`Role::System`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmRequest {
    /// Single-prompt form. Ignored when `messages` is non-empty.
    pub prompt: Option<String>,

    /// Chat form: ordered conversation history.
    #[serde(default)]
    pub messages: Vec<ChatMessage>,

    /// Optional system instructions, prepended as the first message.
    pub system_prompt: Option<String>,

    /// Model identifier (e.g. `"gpt-4o-mini"`, `"llama3.2:3b"`).
    pub model: String,

    /// Temperature (0.0 = deterministic, 1.0 = creative).
    pub temperature: f64,

    /// Maximum tokens to generate.
    pub max_tokens: u32,
}

impl LlmRequest {
    /// Build a single-prompt request.
    pub fn prompt(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            messages: Vec::new(),
            system_prompt: None,
            model: model.into(),
            temperature: 0.7,
            max_tokens: 2048,
        }
    }

    /// Build a chat request from an ordered message list.
    pub fn chat(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            prompt: None,
            messages,
            system_prompt: None,
            model: model.into(),
            temperature: 0.7,
            max_tokens: 2048,
        }
    }

    /// Set the system prompt.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Set the temperature.
    pub fn with_temperature(mut self, temp: f64) -> Self {
        self.temperature = temp;
        self
    }

    /// Set the max token count.
    pub fn with_max_tokens(mut self, tokens: u32) -> Self {
        self.max_tokens = tokens;
        self
    }

    /// Validate the request: non-empty content and model.
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(ProcessorError::invalid_input(
                "model must not be empty",
                &["pass a model identifier such as \"gpt-4o-mini\""],
            ));
        }
        let has_prompt = self.prompt.as_deref().is_some_and(|p| !p.trim().is_empty());
        let has_messages = self.messages.iter().any(|m| !m.content.trim().is_empty());
        if !has_prompt && !has_messages {
            return Err(ProcessorError::invalid_input(
                "request has neither a prompt nor messages",
                &[
                    "set `prompt` to the text to complete",
                    "or provide a non-empty `messages` list",
                ],
            ));
        }
        Ok(())
    }

    /// Resolve the authoritative message list.
    ///
    /// `messages` wins over `prompt`; the system prompt, if present,
    /// becomes the first message with role `system`.
    pub fn effective_messages(&self) -> Vec<ChatMessage> {
        let mut out = Vec::with_capacity(self.messages.len() + 2);
        if let Some(ref sys) = self.system_prompt {
            out.push(ChatMessage {
                role: Role::System,
                content: sys.clone(),
            });
        }
        if !self.messages.is_empty() {
            out.extend(self.messages.iter().cloned());
        } else if let Some(ref p) = self.prompt {
            out.push(ChatMessage {
                role: Role::User,
                content: p.clone(),
            });
        }
        out
    }

    /// Concatenated text of the authoritative content, for token estimation.
    pub fn flattened_text(&self) -> String {
        self.effective_messages()
            .into_iter()
            .map(|m| m.content)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A single message in a chat conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// The role of the message author.
    pub role: Role,
    /// The message content.
    pub content: String,
}

impl ChatMessage {
    /// Shorthand for a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Shorthand for an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// The role of a chat message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions.
    System,
    /// User input.
    User,
    /// Assistant (model) response.
    Assistant,
}

impl Role {
    /// Wire-format string for OpenAI-compatible APIs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Token accounting for one provider call.
///
/// The invariant `total == prompt + completion` is enforced by
/// construction; deserialized values are re-derived on access where the
/// provider reported an inconsistent total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens in the prompt.
    pub prompt: u32,
    /// Tokens in the completion.
    pub completion: u32,
    /// Sum of prompt and completion tokens.
    pub total: u32,
}

impl TokenUsage {
    /// Build a usage record; `total` is derived.
    pub fn new(prompt: u32, completion: u32) -> Self {
        Self {
            prompt,
            completion,
            total: prompt + completion,
        }
    }
}

/// A normalized LLM response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmResponse {
    /// The generated text content.
    pub text: String,

    /// Model that produced the response.
    pub model: String,

    /// Token accounting. Estimated when the provider omits usage.
    pub usage: TokenUsage,

    /// Round-trip latency in milliseconds.
    pub latency_ms: u64,
}

/// Abstraction over LLM endpoints.
///
/// Implementors translate between the normalized [`LlmRequest`] /
/// [`LlmResponse`] and the provider's HTTP API. Concurrent calls on one
/// client are independent; no mutable per-call state is shared.
///
/// # Object Safety
///
/// This trait is object-safe and designed to be used as
/// `Arc<dyn ProviderClient>`.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Execute one LLM call.
    async fn query(&self, request: &LlmRequest) -> Result<LlmResponse>;

    /// Minimal liveness probe, used by the background health checker.
    async fn probe(&self) -> Result<()>;

    /// Human-readable provider name for logging and ranking.
    fn name(&self) -> &str;

    /// Unique id for this client instance, stable for its lifetime.
    /// Format: `<name>-<uuid-v4>`.
    fn instance_id(&self) -> &str;
}

/// Generate an instance id in the mandated `<name>-<uuid>` format.
pub(crate) fn new_instance_id(name: &str) -> String {
    format!("{}-{}", name, uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_total_invariant() {
        let usage = TokenUsage::new(10, 32);
        assert_eq!(usage.total, 42);
    }

    #[test]
    fn test_effective_messages_prompt_form() {
        let req = LlmRequest::prompt("m", "hello").with_system_prompt("be brief");
        let msgs = req.effective_messages();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, Role::System);
        assert_eq!(msgs[0].content, "be brief");
        assert_eq!(msgs[1].role, Role::User);
        assert_eq!(msgs[1].content, "hello");
    }

    #[test]
    fn test_messages_win_over_prompt() {
        let mut req = LlmRequest::prompt("m", "ignored");
        req.messages = vec![ChatMessage::user("authoritative")];
        let msgs = req.effective_messages();
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].content, "authoritative");
    }

    #[test]
    fn test_validate_rejects_empty() {
        let req = LlmRequest::prompt("m", "   ");
        assert!(req.validate().is_err());

        let req = LlmRequest::prompt("", "content");
        assert!(req.validate().is_err());

        let req = LlmRequest::prompt("m", "content");
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_instance_id_format() {
        let id = new_instance_id("openai");
        assert!(id.starts_with("openai-"));
        assert!(id.len() > "openai-".len() + 30);
    }

    #[test]
    fn test_role_wire_strings() {
        assert_eq!(Role::System.as_str(), "system");
        assert_eq!(Role::User.as_str(), "user");
        assert_eq!(Role::Assistant.as_str(), "assistant");
    }
}
