//! Adapter for OpenAI-compatible chat completion and embedding endpoints.
//!
//! Works against a local Ollama (`http://localhost:11434/v1`), OpenRouter, or
//! any other server speaking the same wire format.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use super::error::{ErrorContext, ProviderError};
use super::types::*;

// =============================================================================
// TRAITS
// =============================================================================

/// Trait for chat completion providers.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;
}

/// Trait for embedding providers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, req: &EmbedRequest) -> Result<EmbedResponse, ProviderError>;
}

// =============================================================================
// ADAPTER
// =============================================================================

/// Maximum allowed response body length (1MB).
const MAX_RESPONSE_LEN: usize = 1_024 * 1_024;

/// Maximum allowed input characters (~125k tokens).
const MAX_INPUT_CHARS: usize = 500_000;

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434/v1";

/// HTTP adapter for an OpenAI-compatible API.
#[derive(Debug, Clone)]
pub struct ChatApiAdapter {
    client: reqwest::Client,
    base_url: String,
    provider: &'static str,
}

impl ChatApiAdapter {
    /// Adapter for a local Ollama server on the default port, no API key.
    pub fn local() -> Result<Self, ProviderError> {
        Self::with_config(None, DEFAULT_BASE_URL, Duration::from_secs(120), "ollama")
    }

    /// Create with custom configuration.
    ///
    /// `api_key` is optional since local servers usually don't check it.
    pub fn with_config(
        api_key: Option<String>,
        base_url: impl Into<String>,
        timeout: Duration,
        provider: &'static str,
    ) -> Result<Self, ProviderError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(ProviderError::config("base URL is empty"));
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(key) = api_key.filter(|k| !k.trim().is_empty()) {
            let auth_value = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|_| ProviderError::config("Invalid API key format"))?;
            headers.insert(AUTHORIZATION, auth_value);
        }

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            provider,
        })
    }

    pub fn provider(&self) -> &'static str {
        self.provider
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn embeddings_url(&self) -> String {
        format!("{}/embeddings", self.base_url)
    }

    fn extract_request_id(headers: &HeaderMap) -> Option<String> {
        headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }

    /// Send a JSON body and read the reply with a size cap.
    async fn post_json<T: Serialize + ?Sized>(
        &self,
        url: String,
        body: &T,
    ) -> Result<(reqwest::StatusCode, ErrorContext, String), ProviderError> {
        let mut response = self.client.post(url).json(body).send().await?;

        let status = response.status();
        let request_id = Self::extract_request_id(response.headers());

        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            let new_len = bytes.len() + chunk.len();
            if new_len > MAX_RESPONSE_LEN {
                return Err(ProviderError::provider(
                    self.provider,
                    format!("Response too large: {new_len} bytes"),
                    false,
                ));
            }
            bytes.extend_from_slice(&chunk);
        }

        let ctx = ErrorContext::new().with_status(status.as_u16());
        let ctx = match request_id {
            Some(id) => ctx.with_request_id(id),
            None => ctx,
        };

        Ok((status, ctx, String::from_utf8_lossy(&bytes).to_string()))
    }

    fn classify_failure(&self, status: reqwest::StatusCode, ctx: ErrorContext, body: &str) -> ProviderError {
        let code = status.as_u16();
        let parsed = serde_json::from_str::<ErrorEnvelope>(body)
            .ok()
            .and_then(|e| e.error);

        let (message, ctx) = match parsed {
            Some(error) => {
                let ctx = match error.code {
                    Some(c) => ctx.with_code(c.as_string()),
                    None => ctx,
                };
                (error.message.unwrap_or_default(), ctx)
            }
            None => (format!("HTTP {code}"), ctx),
        };

        match code {
            429 => ProviderError::rate_limited(Duration::from_secs(60), ctx),
            400 | 404 | 422 => ProviderError::InvalidRequest {
                message,
                context: Some(ctx),
            },
            _ => ProviderError::provider_with_context(self.provider, message, code >= 500, ctx),
        }
    }
}

// =============================================================================
// API TYPES
// =============================================================================

#[derive(Serialize)]
struct ChatApiRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
}

#[derive(Deserialize)]
struct ChatApiResponse {
    choices: Option<Vec<Choice>>,
    usage: Option<Usage>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Choice {
    message: Option<ChoiceMessage>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Usage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

#[derive(Serialize)]
struct EmbedApiRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedApiResponse {
    data: Option<Vec<EmbeddingDatum>>,
    usage: Option<EmbedUsage>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

#[derive(Deserialize)]
struct EmbedUsage {
    prompt_tokens: Option<u32>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
    code: Option<ApiErrorCode>,
}

/// Some servers send numeric codes, others strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum ApiErrorCode {
    Text(String),
    Number(i64),
}

impl ApiErrorCode {
    fn as_string(&self) -> String {
        match self {
            ApiErrorCode::Text(s) => s.clone(),
            ApiErrorCode::Number(n) => n.to_string(),
        }
    }
}

// =============================================================================
// PROVIDER IMPLS
// =============================================================================

#[async_trait]
impl ChatProvider for ChatApiAdapter {
    async fn chat(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        let total_chars: usize = req.messages.iter().map(|m| m.content.len()).sum();
        if total_chars > MAX_INPUT_CHARS {
            return Err(ProviderError::invalid_request(format!(
                "Input too large: {total_chars} chars (max {MAX_INPUT_CHARS})"
            )));
        }

        let start = Instant::now();

        let api_req = ChatApiRequest {
            model: req.model.model_id(),
            messages: &req.messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
            stream: false,
        };

        let (status, ctx, body) = self.post_json(self.chat_url(), &api_req).await?;
        if !status.is_success() {
            return Err(self.classify_failure(status, ctx, &body));
        }

        let parsed: ChatApiResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::provider(self.provider, format!("Invalid JSON: {e}"), false)
        })?;

        if let Some(error) = parsed.error {
            let message = error.message.unwrap_or_default();
            return Err(ProviderError::provider(self.provider, message, false));
        }

        let choice = parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .ok_or_else(|| ProviderError::provider(self.provider, "No choices in response", false))?;

        let content = choice
            .message
            .and_then(|m| m.content)
            .unwrap_or_default();

        // Content is returned as-is; empty completions are rejected by the backend.
        // Local servers don't always report usage.
        let (input_tokens, output_tokens) = parsed
            .usage
            .map(|u| (u.prompt_tokens.unwrap_or(0), u.completion_tokens.unwrap_or(0)))
            .unwrap_or((0, 0));

        Ok(ChatResponse {
            content,
            input_tokens,
            output_tokens,
            latency: start.elapsed(),
            finish_reason: FinishReason::from(choice.finish_reason),
        })
    }
}

#[async_trait]
impl EmbeddingProvider for ChatApiAdapter {
    async fn embed(&self, req: &EmbedRequest) -> Result<EmbedResponse, ProviderError> {
        if req.texts.is_empty() {
            return Ok(EmbedResponse {
                embeddings: Vec::new(),
                tokens: 0,
                latency: Duration::from_millis(0),
            });
        }

        let start = Instant::now();
        let api_req = EmbedApiRequest {
            model: &req.model,
            input: &req.texts,
        };

        let (status, ctx, body) = self.post_json(self.embeddings_url(), &api_req).await?;
        if !status.is_success() {
            return Err(self.classify_failure(status, ctx, &body));
        }

        let parsed: EmbedApiResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::provider(self.provider, format!("Invalid JSON: {e}"), false)
        })?;

        if let Some(error) = parsed.error {
            return Err(ProviderError::provider(
                self.provider,
                error.message.unwrap_or_default(),
                false,
            ));
        }

        let mut data = parsed.data.unwrap_or_default();
        if data.len() != req.texts.len() {
            return Err(ProviderError::provider(
                self.provider,
                format!(
                    "Expected {} embeddings, got {}",
                    req.texts.len(),
                    data.len()
                ),
                false,
            ));
        }
        data.sort_by_key(|d| d.index.unwrap_or(usize::MAX));

        Ok(EmbedResponse {
            embeddings: data.into_iter().map(|d| d.embedding).collect(),
            tokens: parsed.usage.and_then(|u| u.prompt_tokens).unwrap_or(0),
            latency: start.elapsed(),
        })
    }
}
