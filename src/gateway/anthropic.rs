//! Anthropic Messages API adapter.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::error::{ErrorContext, ProviderError};
use super::types::*;
use super::{
    check_input_size, classify_http_failure, is_refusal, read_capped_body, request_id_from,
    retry_after_from, send_error, ChatProvider,
};

const PROVIDER: &str = "anthropic";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";

/// The Messages API requires max_tokens on every request.
const DEFAULT_MAX_TOKENS: u32 = 4_096;

/// Anthropic API adapter for chat completions.
#[derive(Debug, Clone)]
pub struct AnthropicAdapter {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl AnthropicAdapter {
    /// Create from API key.
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::with_config(api_key, DEFAULT_BASE_URL, Duration::from_secs(120))
    }

    /// Create from environment variables.
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var("ANTHROPIC_API_KEY")
            .map_err(|_| ProviderError::config("ANTHROPIC_API_KEY not set"))?;

        let base_url =
            std::env::var("ANTHROPIC_BASE_URL").unwrap_or_else(|_| DEFAULT_BASE_URL.into());

        let timeout = std::env::var("ANTHROPIC_TIMEOUT_SECONDS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(120));

        Self::with_config(api_key, base_url, timeout)
    }

    /// Create with custom configuration.
    pub fn with_config(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let api_key = api_key.into();
        let base_url = base_url.into().trim_end_matches('/').to_string();

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));

        let key_value = HeaderValue::from_str(&api_key)
            .map_err(|_| ProviderError::config("Invalid API key format"))?;
        headers.insert("x-api-key", key_value);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            timeout,
        })
    }

    fn messages_url(&self) -> String {
        format!("{}/messages", self.base_url)
    }
}

// =============================================================================
// API TYPES
// =============================================================================

#[derive(Serialize)]
struct MessagesApiRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<&'a Message>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct MessagesApiResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(rename = "type")]
    error_type: Option<String>,
    message: Option<String>,
}

// =============================================================================
// CHAT PROVIDER IMPL
// =============================================================================

#[async_trait]
impl ChatProvider for AnthropicAdapter {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        check_input_size(req)?;

        let start = Instant::now();

        // System text travels out of band; the message list holds only the turns.
        let turns: Vec<&Message> = req
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .collect();
        if turns.is_empty() {
            return Err(ProviderError::invalid_request(
                "Anthropic requests need at least one user message",
            ));
        }

        let mut system = req.system_text();
        if req.json_mode {
            let hint = "Respond with a single JSON object and nothing else.";
            system = Some(match system {
                Some(s) => format!("{s}\n\n{hint}"),
                None => hint.to_string(),
            });
        }

        let api_req = MessagesApiRequest {
            model: req.model.model_id(),
            system,
            messages: turns,
            max_tokens: req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: req.temperature.clamp(0.0, 1.0),
        };

        let response = self
            .client
            .post(self.messages_url())
            .json(&api_req)
            .send()
            .await
            .map_err(|e| send_error(e, self.timeout))?;

        let status = response.status();
        let request_id = request_id_from(response.headers(), "request-id");
        let retry_after = retry_after_from(response.headers());
        let body = read_capped_body(response, PROVIDER, self.timeout).await?;

        let mut ctx = ErrorContext::new().with_status(status.as_u16());
        if let Some(id) = &request_id {
            ctx = ctx.with_request_id(id);
        }

        if !status.is_success() {
            let message = match serde_json::from_str::<ErrorEnvelope>(&body) {
                Ok(ErrorEnvelope { error: Some(err) }) => {
                    if let Some(kind) = err.error_type {
                        ctx = ctx.with_code(kind);
                    }
                    err.message.unwrap_or_default()
                }
                _ => format!("HTTP {}", status.as_u16()),
            };
            return Err(classify_http_failure(PROVIDER, status, message, retry_after, ctx));
        }

        let parsed: MessagesApiResponse = serde_json::from_str(&body)
            .map_err(|e| ProviderError::malformed(PROVIDER, format!("Invalid JSON: {e}")))?;

        let content: String = parsed
            .content
            .into_iter()
            .filter(|b| b.block_type == "text")
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join("");

        if content.trim().is_empty() {
            return Err(ProviderError::malformed(PROVIDER, "No text content in response"));
        }

        if parsed.stop_reason.as_deref() == Some("refusal") || is_refusal(&content) {
            return Err(ProviderError::refused(content));
        }

        let (input_tokens, output_tokens) = parsed
            .usage
            .map(|u| (u.input_tokens.unwrap_or(0), u.output_tokens.unwrap_or(0)))
            .unwrap_or((0, 0));

        Ok(ChatResponse {
            content,
            input_tokens,
            output_tokens,
            latency: start.elapsed(),
            finish_reason: FinishReason::from(parsed.stop_reason),
            request_id,
        })
    }
}
