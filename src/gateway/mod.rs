//! Provider gateway: one chat capability, two wire protocols.

pub mod anthropic;
pub mod error;
pub mod openai;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::StatusCode;

pub use anthropic::AnthropicAdapter;
pub use error::{ErrorContext, ProviderError};
pub use openai::OpenAiAdapter;
pub use types::*;
pub use usage::{
    CallStatus, MemoryUsageSink, NoopUsageSink, ProviderCallRecord, StderrUsageSink, UsageSink,
};

/// Maximum allowed response body length (1MB).
pub(crate) const MAX_RESPONSE_LEN: usize = 1_024 * 1_024;

/// Maximum allowed input characters (~125k tokens).
pub(crate) const MAX_INPUT_CHARS: usize = 500_000;

/// Fallback wait when a 429 carries no usable Retry-After header.
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Trait for chat completion providers.
#[async_trait::async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;
}

#[async_trait::async_trait]
impl<P: ChatProvider + ?Sized> ChatProvider for Arc<P> {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        (**self).chat(req).await
    }
}

/// Both configured adapters, keyed by the protocol they speak.
#[derive(Clone, Default)]
pub struct ProviderSet {
    openai: Option<Arc<dyn ChatProvider>>,
    anthropic: Option<Arc<dyn ChatProvider>>,
}

impl ProviderSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build whichever adapters have credentials in the environment.
    ///
    /// Missing keys are not an error here; a stage bound to an absent
    /// provider fails when the roster is built.
    pub fn from_env() -> Result<Self, ProviderError> {
        let mut set = Self::new();
        if std::env::var("OPENAI_API_KEY").is_ok() {
            set.openai = Some(Arc::new(OpenAiAdapter::from_env()?));
        }
        if std::env::var("ANTHROPIC_API_KEY").is_ok() {
            set.anthropic = Some(Arc::new(AnthropicAdapter::from_env()?));
        }
        Ok(set)
    }

    pub fn with(mut self, kind: ProviderKind, provider: Arc<dyn ChatProvider>) -> Self {
        match kind {
            ProviderKind::OpenAi => self.openai = Some(provider),
            ProviderKind::Anthropic => self.anthropic = Some(provider),
        }
        self
    }

    pub fn get(&self, kind: ProviderKind) -> Result<Arc<dyn ChatProvider>, ProviderError> {
        let slot = match kind {
            ProviderKind::OpenAi => &self.openai,
            ProviderKind::Anthropic => &self.anthropic,
        };
        slot.clone().ok_or_else(|| {
            ProviderError::config(format!("no {} provider configured", kind.as_str()))
        })
    }
}

// =============================================================================
// SHARED HTTP HELPERS
// =============================================================================

pub(crate) fn check_input_size(req: &ChatRequest) -> Result<(), ProviderError> {
    let total_chars = req.input_chars();
    if total_chars > MAX_INPUT_CHARS {
        return Err(ProviderError::invalid_request(format!(
            "Input too large: {total_chars} chars (max {MAX_INPUT_CHARS})"
        )));
    }
    Ok(())
}

pub(crate) fn send_error(err: reqwest::Error, timeout: Duration) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(timeout, None)
    } else {
        ProviderError::Http(err)
    }
}

/// Extract request ID from response headers.
pub(crate) fn request_id_from(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Parse a Retry-After header expressed in whole seconds.
pub(crate) fn retry_after_from(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// Stream the response body, refusing anything over MAX_RESPONSE_LEN.
pub(crate) async fn read_capped_body(
    mut response: reqwest::Response,
    provider: &'static str,
    timeout: Duration,
) -> Result<String, ProviderError> {
    let mut bytes = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| send_error(e, timeout))?
    {
        let new_len = bytes.len() + chunk.len();
        if new_len > MAX_RESPONSE_LEN {
            return Err(ProviderError::malformed(
                provider,
                format!("Response too large: {new_len} bytes"),
            ));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Map a non-2xx status onto the transient/fatal taxonomy.
pub(crate) fn classify_http_failure(
    provider: &'static str,
    status: StatusCode,
    message: String,
    retry_after: Option<Duration>,
    ctx: ErrorContext,
) -> ProviderError {
    let code = status.as_u16();
    match code {
        429 => ProviderError::rate_limited(retry_after.unwrap_or(DEFAULT_RETRY_AFTER), ctx),
        408 => ProviderError::Timeout(Duration::from_secs(0), Some(ctx)),
        400 | 404 | 413 | 422 if is_refusal(&message) => ProviderError::Refused {
            message,
            context: Some(ctx),
        },
        400 | 404 | 413 | 422 => ProviderError::InvalidRequest {
            message,
            context: Some(ctx),
        },
        _ => ProviderError::provider_with_context(provider, message, code >= 500, ctx),
    }
}

/// Check if message indicates a refusal.
pub(crate) fn is_refusal(msg: &str) -> bool {
    let l = msg.trim_start().to_lowercase();
    let first_line = l.lines().next().unwrap_or("");

    const PREFIXES: &[&str] = &[
        "refus",
        "i cannot",
        "i can't",
        "i won't",
        "i will not",
        "i am unable to",
        "i'm unable to",
        "unable to comply",
        "unable to assist",
        "unable to help",
        "unable to provide",
    ];

    PREFIXES.iter().any(|p| first_line.starts_with(p)) || l.contains("request was refused")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refusal_detection_looks_at_first_line() {
        assert!(is_refusal("I cannot help with that."));
        assert!(is_refusal("  I'm unable to write this story"));
        assert!(!is_refusal("Chapter 1\nI cannot believe the tide, she thought."));
    }

    #[test]
    fn status_classification() {
        let ctx = ErrorContext::new;
        let rate = classify_http_failure(
            "openai",
            StatusCode::TOO_MANY_REQUESTS,
            "slow down".into(),
            Some(Duration::from_secs(7)),
            ctx(),
        );
        match rate {
            ProviderError::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Duration::from_secs(7))
            }
            other => panic!("expected rate limit, got {other:?}"),
        }

        let overloaded =
            classify_http_failure("anthropic", StatusCode::from_u16(529).unwrap(), "x".into(), None, ctx());
        assert!(overloaded.is_retryable());

        let bad = classify_http_failure("openai", StatusCode::BAD_REQUEST, "bad".into(), None, ctx());
        assert!(!bad.is_retryable());
        assert_eq!(bad.code(), "invalid_request");

        let auth = classify_http_failure("openai", StatusCode::UNAUTHORIZED, "no".into(), None, ctx());
        assert!(!auth.is_retryable());
    }

    #[test]
    fn provider_set_reports_missing_binding() {
        let set = ProviderSet::new();
        let err = set.get(ProviderKind::Anthropic).err().unwrap();
        assert_eq!(err.code(), "config_error");
    }
}
