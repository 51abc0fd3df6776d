//! HTTP adapter for OpenAI-compatible chat completion endpoints.
//!
//! Every configured provider is reached through the same wire shape; the
//! profile supplies base URL, model and API key location.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use crate::config::ProviderProfile;

use super::error::{ErrorContext, ProviderError};
use super::pricing::generation_cost;
use super::{GenerateRequest, GenerateResponse};

/// Maximum allowed response content length (1MB).
const MAX_RESPONSE_LEN: usize = 1_024 * 1_024;

/// Maximum allowed input characters (~125k tokens).
const MAX_INPUT_CHARS: usize = 500_000;

/// Trait for chat completion providers.
#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn generate(&self, req: &GenerateRequest) -> Result<GenerateResponse, ProviderError>;
}

/// Chat completions adapter for one configured provider.
#[derive(Debug, Clone)]
pub struct ChatAdapter {
    client: reqwest::Client,
    provider_id: String,
    model: String,
    base_url: String,
}

impl ChatAdapter {
    /// Build from a provider profile, reading the API key from the
    /// profile's environment variable.
    pub fn from_profile(profile: &ProviderProfile, timeout: Duration) -> Result<Self, ProviderError> {
        let api_key = std::env::var(&profile.api_key_env)
            .map_err(|_| ProviderError::config(format!("{} not set", profile.api_key_env)))?;
        Self::with_config(profile, &api_key, timeout)
    }

    pub fn with_config(
        profile: &ProviderProfile,
        api_key: &str,
        timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let auth_value = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| ProviderError::config("Invalid API key format"))?;
        headers.insert(AUTHORIZATION, auth_value);

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .gzip(true)
            .build()
            .map_err(|e| ProviderError::config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            provider_id: profile.id.clone(),
            model: profile.model.clone(),
            base_url: profile.base_url.clone(),
        })
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn chat_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn extract_request_id(headers: &reqwest::header::HeaderMap) -> Option<String> {
        headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }
}

// =============================================================================
// API TYPES
// =============================================================================

#[derive(Serialize)]
struct ChatApiRequest<'a> {
    model: &'a str,
    messages: Vec<ApiMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
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

#[derive(Deserialize)]
struct ApiError {
    message: Option<String>,
    code: Option<String>,
}

// =============================================================================
// CHAT PROVIDER IMPL
// =============================================================================

#[async_trait]
impl ChatProvider for ChatAdapter {
    async fn generate(&self, req: &GenerateRequest) -> Result<GenerateResponse, ProviderError> {
        let total_chars = req.prompt.len() + req.system.as_deref().map_or(0, str::len);
        if total_chars > MAX_INPUT_CHARS {
            return Err(ProviderError::invalid_request(format!(
                "Input too large: {total_chars} chars (max {MAX_INPUT_CHARS})"
            )));
        }

        let start = Instant::now();

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &req.system {
            messages.push(ApiMessage {
                role: "system",
                content: system,
            });
        }
        messages.push(ApiMessage {
            role: "user",
            content: &req.prompt,
        });

        let api_req = ChatApiRequest {
            model: &self.model,
            messages,
            temperature: req.temperature,
            max_tokens: req.max_tokens,
        };

        let mut response = self
            .client
            .post(self.chat_url())
            .json(&api_req)
            .send()
            .await?;

        let status = response.status();
        let request_id = Self::extract_request_id(response.headers());

        // Stream response to enforce size limit
        let mut bytes = Vec::new();
        while let Some(chunk) = response.chunk().await? {
            let new_len = bytes.len() + chunk.len();
            if new_len > MAX_RESPONSE_LEN {
                return Err(ProviderError::unavailable(
                    &self.provider_id,
                    format!("Response too large: {new_len} bytes"),
                ));
            }
            bytes.extend_from_slice(&chunk);
        }

        let body = String::from_utf8_lossy(&bytes).to_string();

        let ctx = ErrorContext::new().with_status(status.as_u16());
        let ctx = if let Some(id) = &request_id {
            ctx.with_request_id(id)
        } else {
            ctx
        };

        if !status.is_success() {
            let (message, ctx) = match serde_json::from_str::<ChatApiResponse>(&body) {
                Ok(parsed) => match parsed.error {
                    Some(error) => {
                        let msg = error.message.unwrap_or_default();
                        let ctx = match error.code {
                            Some(code) => ctx.with_code(code),
                            None => ctx,
                        };
                        (msg, ctx)
                    }
                    None => (format!("HTTP {}", status.as_u16()), ctx),
                },
                Err(_) => (format!("HTTP {}", status.as_u16()), ctx),
            };

            return Err(match status.as_u16() {
                429 => ProviderError::rate_limited(&self.provider_id, Duration::from_secs(60), ctx),
                code if code >= 500 => {
                    ProviderError::unavailable_with_context(&self.provider_id, message, ctx)
                }
                _ => ProviderError::InvalidRequest {
                    message,
                    context: Some(ctx),
                },
            });
        }

        let parsed: ChatApiResponse = serde_json::from_str(&body).map_err(|e| {
            ProviderError::unavailable(&self.provider_id, format!("Invalid JSON: {e}"))
        })?;

        if let Some(error) = parsed.error {
            return Err(ProviderError::unavailable(
                &self.provider_id,
                error.message.unwrap_or_default(),
            ));
        }

        let mut content = parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .ok_or_else(|| {
                ProviderError::unavailable(&self.provider_id, "No choices in response")
            })?;
        if content.len() > MAX_RESPONSE_LEN {
            content.truncate(MAX_RESPONSE_LEN);
        }

        let usage = parsed.usage.ok_or_else(|| {
            ProviderError::unavailable(&self.provider_id, "Missing usage in response")
        })?;

        let input_tokens = usage.prompt_tokens.unwrap_or(0);
        let output_tokens = usage.completion_tokens.unwrap_or(0);

        Ok(GenerateResponse {
            provider_id: self.provider_id.clone(),
            model: self.model.clone(),
            content,
            input_tokens,
            output_tokens,
            cost_nanodollars: generation_cost(&self.model, input_tokens, output_tokens),
            latency: start.elapsed(),
        })
    }
}
