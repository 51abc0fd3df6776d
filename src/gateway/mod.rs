//! Provider gateway for chat completions across the configured table.
//!
//! One `ChatAdapter` per configured provider, all behind a single retrying
//! gateway. Routing decides *which* provider a fragment goes to; the gateway
//! only knows how to reach it, retry transient failures and record usage.

pub mod adapter;
pub mod error;
pub mod pricing;
pub mod usage;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use uuid::Uuid;

use crate::config::PipelineConfig;

use adapter::{ChatAdapter, ChatProvider};
use usage::{ProviderCallRecord, UsageSink};

pub use adapter::ChatAdapter as Adapter;
pub use error::{ErrorContext, ProviderError};
pub use pricing::{generation_cost, get_pricing, premium_reference_cost, ModelPricing};
pub use usage::{CallStatus, NoopUsageSink, StderrUsageSink};

/// A single generation request bound for one provider.
#[derive(Debug, Clone)]
pub struct GenerateRequest {
    /// Provider id from the configured table.
    pub provider_id: String,
    /// User-visible prompt content.
    pub prompt: String,
    /// Optional system framing.
    pub system: Option<String>,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
    /// Pipeline request this call belongs to, for usage attribution.
    pub request_id: Option<Uuid>,
    /// Fragment this call serves, for usage attribution.
    pub fragment_id: Option<String>,
    /// Which code path made this call.
    pub caller: &'static str,
}

impl GenerateRequest {
    pub fn new(provider_id: impl Into<String>, prompt: impl Into<String>, caller: &'static str) -> Self {
        Self {
            provider_id: provider_id.into(),
            prompt: prompt.into(),
            system: None,
            temperature: 0.3,
            max_tokens: None,
            request_id: None,
            fragment_id: None,
            caller,
        }
    }

    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.temperature = t;
        self
    }

    pub fn max_tokens(mut self, max: u32) -> Self {
        self.max_tokens = Some(max);
        self
    }

    pub fn request(mut self, request_id: Uuid) -> Self {
        self.request_id = Some(request_id);
        self
    }

    pub fn fragment(mut self, fragment_id: impl Into<String>) -> Self {
        self.fragment_id = Some(fragment_id.into());
        self
    }
}

/// Response from a generation request.
#[derive(Debug, Clone)]
pub struct GenerateResponse {
    pub provider_id: String,
    pub model: String,
    pub content: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Cost in nanodollars (1e-9 USD).
    pub cost_nanodollars: i64,
    pub latency: Duration,
}

impl GenerateResponse {
    pub fn tokens_used(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// Seam for the distributor: anything that can run a generation call.
/// Tests use a scripted implementation; production uses `ProviderGateway`.
#[async_trait::async_trait]
pub trait GenerateGateway: Send + Sync {
    async fn generate(&self, req: GenerateRequest) -> Result<GenerateResponse, ProviderError>;
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

/// Retrying gateway over the configured provider adapters.
pub struct ProviderGateway {
    adapters: HashMap<String, ChatAdapter>,
    usage_sink: Arc<dyn UsageSink>,
    config: GatewayConfig,
}

#[async_trait::async_trait]
impl GenerateGateway for ProviderGateway {
    async fn generate(&self, req: GenerateRequest) -> Result<GenerateResponse, ProviderError> {
        ProviderGateway::generate(self, req).await
    }
}

impl ProviderGateway {
    /// Build adapters for every provider in the pipeline config, reading API
    /// keys from the environment. Fails if any configured key is missing.
    pub fn from_config(
        config: &PipelineConfig,
        usage_sink: Arc<dyn UsageSink>,
    ) -> Result<Self, ProviderError> {
        let mut adapters = HashMap::new();
        for profile in &config.providers {
            let adapter = ChatAdapter::from_profile(profile, config.attempt_timeout)?;
            adapters.insert(profile.id.clone(), adapter);
        }
        Ok(Self {
            adapters,
            usage_sink,
            config: GatewayConfig {
                max_retries: config.max_retries,
                retry_base_delay: config.retry_base_delay,
            },
        })
    }

    pub fn with_adapters(
        adapters: HashMap<String, ChatAdapter>,
        usage_sink: Arc<dyn UsageSink>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            adapters,
            usage_sink,
            config,
        }
    }

    pub async fn generate(&self, req: GenerateRequest) -> Result<GenerateResponse, ProviderError> {
        let adapter = self
            .adapters
            .get(&req.provider_id)
            .ok_or_else(|| ProviderError::UnknownProvider(req.provider_id.clone()))?;

        let mut last_error: Option<ProviderError> = None;

        for attempt in 0..=self.config.max_retries {
            match adapter.generate(&req).await {
                Ok(resp) => {
                    self.record_usage(&req, Some(&resp), None).await;
                    return Ok(resp);
                }
                Err(err) => {
                    self.record_usage(&req, None, Some(err.code().to_string()))
                        .await;

                    if !err.is_retryable() || attempt == self.config.max_retries {
                        return Err(err);
                    }

                    let delay = backoff_delay(self.config.retry_base_delay, attempt);
                    tracing::debug!(
                        provider = %req.provider_id,
                        attempt,
                        ?delay,
                        error = %err,
                        "retrying provider call"
                    );
                    last_error = Some(err);
                    sleep(delay).await;
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| ProviderError::unavailable(req.provider_id.clone(), "unknown error")))
    }

    async fn record_usage(
        &self,
        req: &GenerateRequest,
        resp: Option<&GenerateResponse>,
        error_code: Option<String>,
    ) {
        let adapter = self.adapters.get(&req.provider_id);
        let model = adapter.map(|a| a.model().to_string()).unwrap_or_default();

        let mut record = ProviderCallRecord::new(req.provider_id.clone(), model, req.caller)
            .request(req.request_id)
            .fragment(req.fragment_id.clone());

        if let Some(resp) = resp {
            record = record
                .tokens(resp.input_tokens as i32, resp.output_tokens as i32)
                .cost(resp.cost_nanodollars)
                .latency(resp.latency.as_millis() as i32);
        }
        if let Some(code) = error_code {
            record = record.error(code);
        }

        self.usage_sink.record(record).await;
    }
}

/// Exponential backoff with a small random jitter to avoid thundering herds.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let multiplier = 2u64.pow(attempt.min(5));
    let jitter = rand::thread_rng().gen_range(0.8..1.2);
    base.mul_f64(multiplier as f64 * jitter)
}
