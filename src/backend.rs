//! Generation backends: one per stage, each with its own model and temperature.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gateway::{Attribution, ChatGateway, ChatModel, ChatRequest, Message, ProviderError};

/// Model identity and sampling settings for one backend.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BackendConfig {
    pub model: String,
    pub temperature: f32,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Optional system message sent before the rendered prompt.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Give up on a call after this many seconds. `None` waits indefinitely.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl BackendConfig {
    pub fn new(model: impl Into<String>, temperature: f32) -> Self {
        Self {
            model: model.into(),
            temperature,
            max_tokens: None,
            system_prompt: None,
            timeout_secs: None,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("model {model} returned an empty completion")]
    EmptyCompletion { model: String },
    #[error("model {model} did not answer within {timeout:?}")]
    Timeout { model: String, timeout: Duration },
}

/// A callable text-generation capability.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Model identity, for logs and reports.
    fn model_id(&self) -> &str;

    async fn generate(&self, prompt: &str, run_id: Uuid) -> Result<String, GenerationError>;
}

/// [`GenerationBackend`] over a [`ChatGateway`].
///
/// The rendered prompt goes out as a single user message. Retries are the
/// gateway's business; this layer only adds the timeout and rejects empty
/// completions.
pub struct GatewayBackend {
    gateway: Arc<dyn ChatGateway>,
    config: BackendConfig,
    caller: &'static str,
}

impl GatewayBackend {
    pub fn new(gateway: Arc<dyn ChatGateway>, config: BackendConfig, caller: &'static str) -> Self {
        Self {
            gateway,
            config,
            caller,
        }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn build_request(&self, prompt: &str, run_id: Uuid) -> ChatRequest {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = self.config.system_prompt.as_deref() {
            if !system.trim().is_empty() {
                messages.push(Message::system(system));
            }
        }
        messages.push(Message::user(prompt));

        let req = ChatRequest::new(
            ChatModel::new(&self.config.model),
            messages,
            Attribution::new(self.caller).with_run(run_id),
        )
        .temperature(self.config.temperature);

        match self.config.max_tokens {
            Some(max) => req.max_tokens(max),
            None => req,
        }
    }
}

#[async_trait]
impl GenerationBackend for GatewayBackend {
    fn model_id(&self) -> &str {
        &self.config.model
    }

    async fn generate(&self, prompt: &str, run_id: Uuid) -> Result<String, GenerationError> {
        let req = self.build_request(prompt, run_id);

        let resp = match self.config.timeout() {
            Some(timeout) => tokio::time::timeout(timeout, self.gateway.chat(req))
                .await
                .map_err(|_| GenerationError::Timeout {
                    model: self.config.model.clone(),
                    timeout,
                })??,
            None => self.gateway.chat(req).await?,
        };

        let content = resp.content.trim();
        if content.is_empty() {
            return Err(GenerationError::EmptyCompletion {
                model: self.config.model.clone(),
            });
        }
        Ok(content.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{ChatResponse, FinishReason, Role};
    use std::sync::Mutex;

    struct RecordingGateway {
        seen: Mutex<Vec<ChatRequest>>,
        reply: String,
    }

    #[async_trait]
    impl ChatGateway for RecordingGateway {
        async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
            self.seen.lock().unwrap().push(req);
            Ok(ChatResponse {
                content: self.reply.clone(),
                input_tokens: 1,
                output_tokens: 1,
                latency: Duration::from_millis(1),
                finish_reason: FinishReason::Stop,
            })
        }
    }

    #[tokio::test]
    async fn sends_prompt_with_configured_model_and_temperature() {
        let gateway = Arc::new(RecordingGateway {
            seen: Mutex::new(Vec::new()),
            reply: "  generated text \n".into(),
        });
        let mut config = BackendConfig::new("llama3", 0.5);
        config.system_prompt = Some("be terse".into());
        let backend = GatewayBackend::new(gateway.clone(), config, "pipeline::plan");

        let out = backend.generate("rendered", Uuid::new_v4()).await.unwrap();
        assert_eq!(out, "generated text");

        let seen = gateway.seen.lock().unwrap();
        let req = &seen[0];
        assert_eq!(req.model.model_id(), "llama3");
        assert!((req.temperature - 0.5).abs() < f32::EPSILON);
        assert_eq!(req.attribution.caller, "pipeline::plan");
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[0].role, Role::System);
        assert_eq!(req.messages[1].content, "rendered");
    }

    #[tokio::test]
    async fn blank_completion_is_an_error() {
        let gateway = Arc::new(RecordingGateway {
            seen: Mutex::new(Vec::new()),
            reply: "   ".into(),
        });
        let backend =
            GatewayBackend::new(gateway, BackendConfig::new("phi3", 0.3), "pipeline::evaluation");

        let err = backend.generate("p", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, GenerationError::EmptyCompletion { .. }));
    }
}
