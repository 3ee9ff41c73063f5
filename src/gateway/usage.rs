//! Usage tracking via the UsageSink trait.
//!
//! The gateway logs all calls through a UsageSink, which decouples it from
//! wherever the records end up:
//! - the CLI uses `TracingUsageSink` (structured log events)
//! - tests use `NoopUsageSink` or their own collecting sink

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Status of a provider call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Success,
    Error,
}

impl CallStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallStatus::Success => "success",
            CallStatus::Error => "error",
        }
    }
}

/// Record of a provider API call.
#[derive(Debug, Clone)]
pub struct ProviderCallRecord {
    /// Provider name: "ollama", "openrouter", ...
    pub provider: &'static str,
    /// Endpoint: "chat/completions" or "embeddings".
    pub endpoint: &'static str,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub run_id: Option<Uuid>,
    pub latency_ms: u64,
    pub status: CallStatus,
    /// Error code if status is Error.
    pub error_code: Option<String>,
    /// Which code path made this call.
    pub caller: &'static str,
    /// Retry attempt (0 = first try).
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

impl ProviderCallRecord {
    pub fn new(
        provider: &'static str,
        endpoint: &'static str,
        model: impl Into<String>,
        caller: &'static str,
    ) -> Self {
        Self {
            provider,
            endpoint,
            model: model.into(),
            input_tokens: 0,
            output_tokens: 0,
            run_id: None,
            latency_ms: 0,
            status: CallStatus::Success,
            error_code: None,
            caller,
            attempt: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn tokens(mut self, input: u32, output: u32) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }

    pub fn run(mut self, run_id: Option<Uuid>) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn latency(mut self, ms: u64) -> Self {
        self.latency_ms = ms;
        self
    }

    pub fn attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn error(mut self, code: impl Into<String>) -> Self {
        self.status = CallStatus::Error;
        self.error_code = Some(code.into());
        self
    }
}

/// Trait for recording provider call usage.
#[async_trait]
pub trait UsageSink: Send + Sync {
    /// Record a provider call. Fire-and-forget: failures are logged, never
    /// propagated.
    async fn record(&self, record: ProviderCallRecord);
}

/// Usage sink that discards all records.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUsageSink;

#[async_trait]
impl UsageSink for NoopUsageSink {
    async fn record(&self, _record: ProviderCallRecord) {}
}

/// Usage sink that emits one `tracing` event per call.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingUsageSink;

#[async_trait]
impl UsageSink for TracingUsageSink {
    async fn record(&self, record: ProviderCallRecord) {
        let run_id = record.run_id.map(|id| id.to_string()).unwrap_or_default();
        match record.status {
            CallStatus::Success => tracing::info!(
                target: "crossprompt::usage",
                provider = record.provider,
                endpoint = record.endpoint,
                model = %record.model,
                caller = record.caller,
                run_id = %run_id,
                input_tokens = record.input_tokens,
                output_tokens = record.output_tokens,
                latency_ms = record.latency_ms,
                attempt = record.attempt,
                "provider call"
            ),
            CallStatus::Error => tracing::warn!(
                target: "crossprompt::usage",
                provider = record.provider,
                endpoint = record.endpoint,
                model = %record.model,
                caller = record.caller,
                run_id = %run_id,
                error_code = record.error_code.as_deref().unwrap_or("unknown"),
                attempt = record.attempt,
                "provider call failed"
            ),
        }
    }
}
