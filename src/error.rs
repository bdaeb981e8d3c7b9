use std::time::Duration;
use thiserror::Error;

/// Errors produced by the processor and its components.
#[derive(Error, Debug)]
pub enum ProcessorError {
    /// Malformed or missing arguments at an entry point. Carries remediation
    /// suggestions surfaced at the tool boundary. Never reaches a provider.
    #[error("invalid input: {message}")]
    InvalidInput {
        /// What was wrong with the input.
        message: String,
        /// Up to three remediation hints.
        suggestions: Vec<String>,
    },

    /// The provider rejected our credential.
    #[error("authentication failed for provider '{provider}'")]
    Auth {
        /// Name of the rejecting provider.
        provider: String,
    },

    /// The provider applied rate limiting (HTTP 429 or equivalent).
    #[error("rate limited by provider '{provider}'")]
    RateLimited {
        /// Name of the limiting provider.
        provider: String,
        /// Parsed `Retry-After` hint, if the provider sent one.
        retry_after: Option<Duration>,
    },

    /// A deadline elapsed before the operation completed.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// Low-level HTTP transport failure (connection refused, DNS, TLS).
    #[error("HTTP request failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// The provider returned something that is not usable text
    /// (HTML error page, empty body, unexpected shape).
    #[error("provider '{provider}' returned unusable content: {detail}")]
    Content {
        /// Name of the offending provider.
        provider: String,
        /// Short description of what came back.
        detail: String,
    },

    /// HTTP error with status code and response body.
    #[error("HTTP {status}: {body}")]
    Http {
        /// HTTP status code (e.g. 429, 500, 503).
        status: u16,
        /// Response body text.
        body: String,
    },

    /// A submission was rejected because the queue is at its high-water mark.
    #[error("request queue for '{provider}' is full")]
    QueueFull {
        /// Provider whose queue rejected the item.
        provider: String,
    },

    /// Every registered provider failed across all retry rounds.
    #[error("all {providers} providers failed after {attempts} attempts: {last}")]
    AllProvidersFailed {
        /// Number of providers tried.
        providers: usize,
        /// Total provider calls attempted.
        attempts: u32,
        /// Description of the last error observed.
        last: String,
    },

    /// A value exceeded the cache's size limit. Surfaced, never dropped.
    #[error("cache value of {size} bytes exceeds limit of {limit} bytes")]
    CacheTooLarge {
        /// Serialized value size.
        size: usize,
        /// Configured maximum.
        limit: usize,
    },

    /// A named service was not registered at startup. Fatal.
    #[error("service '{0}' is not registered")]
    ServiceMissing(String),

    /// Disk persistence failed; the owning subsystem degrades to memory-only.
    #[error("persistence failed: {0}")]
    Persistence(String),

    /// JSON (de)serialization failed at the serde level.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation was cancelled via the cancellation flag.
    #[error("operation was cancelled")]
    Cancelled,

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl ProcessorError {
    /// Whether retrying the same operation could succeed.
    ///
    /// Transient remote failures (timeouts, rate limits, 5xx, transport)
    /// are retryable. Authoritative rejections (auth, other 4xx, bad
    /// input) are not: the dispatcher moves to the next provider instead.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProcessorError::RateLimited { .. }
            | ProcessorError::Timeout(_)
            | ProcessorError::Transport(_) => true,
            ProcessorError::Http { status, .. } => matches!(status, 429 | 500 | 502 | 503 | 504),
            _ => false,
        }
    }

    /// Stable machine-readable class name, used in error payloads
    /// at the tool boundary and in health records.
    pub fn class(&self) -> &'static str {
        match self {
            ProcessorError::InvalidInput { .. } => "invalid_input",
            ProcessorError::Auth { .. } => "auth",
            ProcessorError::RateLimited { .. } => "rate_limited",
            ProcessorError::Timeout(_) => "timeout",
            ProcessorError::Transport(_) => "transport",
            ProcessorError::Content { .. } => "content",
            ProcessorError::Http { .. } => "http",
            ProcessorError::QueueFull { .. } => "queue_full",
            ProcessorError::AllProvidersFailed { .. } => "all_providers_failed",
            ProcessorError::CacheTooLarge { .. } => "cache_too_large",
            ProcessorError::ServiceMissing(_) => "service_missing",
            ProcessorError::Persistence(_) => "persistence",
            ProcessorError::Json(_) => "json",
            ProcessorError::Io(_) => "io",
            ProcessorError::Cancelled => "cancelled",
            ProcessorError::Other(_) => "other",
        }
    }

    /// Shorthand for a validation error with suggestions.
    pub fn invalid_input(message: impl Into<String>, suggestions: &[&str]) -> Self {
        ProcessorError::InvalidInput {
            message: message.into(),
            suggestions: suggestions.iter().take(3).map(|s| s.to_string()).collect(),
        }
    }
}

impl From<anyhow::Error> for ProcessorError {
    fn from(err: anyhow::Error) -> Self {
        ProcessorError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ProcessorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_rate_limit() {
        let err = ProcessorError::RateLimited {
            provider: "a".into(),
            retry_after: None,
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_retryable_5xx() {
        let err = ProcessorError::Http {
            status: 503,
            body: "unavailable".into(),
        };
        assert!(err.is_retryable());
    }

    #[test]
    fn test_auth_not_retryable() {
        let err = ProcessorError::Auth {
            provider: "a".into(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_4xx_not_retryable() {
        let err = ProcessorError::Http {
            status: 400,
            body: "bad request".into(),
        };
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_invalid_input_caps_suggestions() {
        let err = ProcessorError::invalid_input("empty problem", &["a", "b", "c", "d"]);
        if let ProcessorError::InvalidInput { suggestions, .. } = err {
            assert_eq!(suggestions.len(), 3);
        } else {
            panic!("wrong variant");
        }
    }

    #[test]
    fn test_class_names_stable() {
        assert_eq!(ProcessorError::Cancelled.class(), "cancelled");
        assert_eq!(
            ProcessorError::Timeout(Duration::from_secs(1)).class(),
            "timeout"
        );
    }
}
