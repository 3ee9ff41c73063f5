//! Core types for the provider gateway.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

// =============================================================================
// ATTRIBUTION
// =============================================================================

/// Attribution for usage logging and debugging.
///
/// Every request through the gateway carries attribution so a usage record can
/// be tied back to the run and the stage that triggered it.
#[derive(Debug, Clone, Default)]
pub struct Attribution {
    /// Pipeline run this request is part of.
    pub run_id: Option<Uuid>,
    /// Which code path made this call, e.g. "pipeline::summary".
    pub caller: &'static str,
}

impl Attribution {
    pub fn new(caller: &'static str) -> Self {
        Self {
            caller,
            ..Default::default()
        }
    }

    pub fn with_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

// =============================================================================
// EMBEDDING TYPES
// =============================================================================

/// Request to embed texts.
#[derive(Debug, Clone)]
pub struct EmbedRequest {
    /// Embedding model id, e.g. "all-minilm" or "text-embedding-3-small".
    pub model: String,
    /// Texts to embed. Each text produces one embedding vector.
    pub texts: Vec<String>,
    pub attribution: Attribution,
}

impl EmbedRequest {
    pub fn new(model: impl Into<String>, texts: Vec<String>, attribution: Attribution) -> Self {
        Self {
            model: model.into(),
            texts,
            attribution,
        }
    }
}

/// Response from embedding request.
#[derive(Debug, Clone)]
pub struct EmbedResponse {
    /// Embedding vectors, one per input text, in input order.
    pub embeddings: Vec<Vec<f32>>,
    /// Total tokens consumed (0 when the provider doesn't report usage).
    pub tokens: u32,
    pub latency: Duration,
}

// =============================================================================
// CHAT TYPES
// =============================================================================

/// Chat message role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Chat model identity as understood by the endpoint, e.g. "mistral" on a
/// local Ollama or "anthropic/claude-3-5-haiku" on OpenRouter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatModel(String);

impl ChatModel {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self(model_id.into())
    }

    pub fn model_id(&self) -> &str {
        &self.0
    }
}

/// Request for chat completion.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: ChatModel,
    pub messages: Vec<Message>,
    /// Sampling temperature (0.0 - 2.0).
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    pub attribution: Attribution,
}

impl ChatRequest {
    pub fn new(model: ChatModel, messages: Vec<Message>, attribution: Attribution) -> Self {
        Self {
            model,
            messages,
            temperature: 0.0,
            max_tokens: None,
            attribution,
        }
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }
}

/// Reason the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Unknown(String),
}

impl From<Option<String>> for FinishReason {
    fn from(s: Option<String>) -> Self {
        match s.as_deref() {
            Some("stop") => FinishReason::Stop,
            Some("length") => FinishReason::Length,
            Some("content_filter") => FinishReason::ContentFilter,
            Some(other) => FinishReason::Unknown(other.to_string()),
            None => FinishReason::Unknown("none".to_string()),
        }
    }
}

/// Response from chat completion.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub latency: Duration,
    pub finish_reason: FinishReason,
}

impl ChatResponse {
    pub(crate) fn empty() -> Self {
        Self {
            content: String::new(),
            input_tokens: 0,
            output_tokens: 0,
            latency: Duration::from_millis(0),
            finish_reason: FinishReason::Unknown("error".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_reason_parses_known_and_unknown() {
        assert_eq!(FinishReason::from(Some("stop".into())), FinishReason::Stop);
        assert_eq!(FinishReason::from(Some("length".into())), FinishReason::Length);
        assert_eq!(
            FinishReason::from(Some("eos".into())),
            FinishReason::Unknown("eos".into())
        );
        assert_eq!(FinishReason::from(None), FinishReason::Unknown("none".into()));
    }

    #[test]
    fn chat_request_builder_sets_sampling() {
        let req = ChatRequest::new(
            ChatModel::new("mistral"),
            vec![Message::user("hi")],
            Attribution::new("test"),
        )
        .temperature(0.4)
        .max_tokens(256);

        assert_eq!(req.model.model_id(), "mistral");
        assert!((req.temperature - 0.4).abs() < f32::EPSILON);
        assert_eq!(req.max_tokens, Some(256));
    }
}
