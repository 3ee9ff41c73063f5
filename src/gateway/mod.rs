//! Provider gateway for chat completions.

pub mod chat_api;
pub mod error;
pub mod types;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;

use chat_api::{ChatApiAdapter, ChatProvider};
use usage::{CallStatus, ProviderCallRecord};

pub use error::{ErrorContext, ProviderError};
pub use types::*;
pub use usage::{NoopUsageSink, TracingUsageSink, UsageSink};

#[async_trait::async_trait]
pub trait ChatGateway: Send + Sync {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError>;
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub max_retries: u32,
    pub retry_base_delay: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_base_delay: Duration::from_secs(1),
        }
    }
}

/// Chat gateway with bounded retries and usage recording.
pub struct ProviderGateway<P: ChatProvider = ChatApiAdapter> {
    provider: P,
    provider_name: &'static str,
    usage_sink: Arc<dyn UsageSink>,
    config: GatewayConfig,
}

#[async_trait::async_trait]
impl<P: ChatProvider> ChatGateway for ProviderGateway<P> {
    async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        ProviderGateway::chat(self, req).await
    }
}

impl ProviderGateway<ChatApiAdapter> {
    pub fn new(adapter: ChatApiAdapter, usage_sink: Arc<dyn UsageSink>) -> Self {
        Self::with_config(adapter, usage_sink, GatewayConfig::default())
    }

    pub fn with_config(
        adapter: ChatApiAdapter,
        usage_sink: Arc<dyn UsageSink>,
        config: GatewayConfig,
    ) -> Self {
        let provider_name = adapter.provider();
        Self::with_provider(adapter, provider_name, usage_sink, config)
    }
}

impl<P: ChatProvider> ProviderGateway<P> {
    pub fn with_provider(
        provider: P,
        provider_name: &'static str,
        usage_sink: Arc<dyn UsageSink>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            provider,
            provider_name,
            usage_sink,
            config,
        }
    }

    pub async fn chat(&self, req: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let mut last_error: Option<ProviderError> = None;

        for attempt in 0..=self.config.max_retries {
            match self.provider.chat(&req).await {
                Ok(resp) => {
                    self.record_usage(&req, &resp, attempt, CallStatus::Success, None)
                        .await;
                    return Ok(resp);
                }
                Err(err) => {
                    let code = err.code().to_string();
                    self.record_usage(
                        &req,
                        &ChatResponse::empty(),
                        attempt,
                        CallStatus::Error,
                        Some(code),
                    )
                    .await;

                    if !err.is_retryable() || attempt == self.config.max_retries {
                        return Err(err);
                    }

                    let delay = backoff_delay(self.config.retry_base_delay, attempt);
                    tracing::debug!(
                        caller = req.attribution.caller,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "retrying chat call"
                    );
                    last_error = Some(err);
                    sleep(delay).await;
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ProviderError::provider(self.provider_name, "unknown error", false)))
    }

    async fn record_usage(
        &self,
        req: &ChatRequest,
        resp: &ChatResponse,
        attempt: u32,
        status: CallStatus,
        error_code: Option<String>,
    ) {
        let record = ProviderCallRecord::new(
            self.provider_name,
            "chat/completions",
            req.model.model_id(),
            req.attribution.caller,
        )
        .tokens(resp.input_tokens, resp.output_tokens)
        .run(req.attribution.run_id)
        .latency(u64::try_from(resp.latency.as_millis()).unwrap_or(u64::MAX))
        .attempt(attempt);

        let record = if status == CallStatus::Error {
            record.error(error_code.unwrap_or_else(|| "provider_error".to_string()))
        } else {
            record
        };

        self.usage_sink.record(record).await;
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u64.pow(attempt.min(5));
    base * multiplier as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 1), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, 3), Duration::from_millis(800));
        assert_eq!(backoff_delay(base, 9), Duration::from_millis(3200));
    }
}
