//! Pipeline and provider configuration.
//!
//! The provider table is the single source of truth for routing decisions:
//! the router reads cost tiers and data-handling flags from here, and the
//! gateway builds one HTTP adapter per entry.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Relative price band of a provider's configured model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostTier {
    Economy,
    Standard,
    Premium,
}

/// One configured upstream provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderProfile {
    /// Stable identifier used in assignments and usage records.
    pub id: String,
    /// Model id sent on the wire and used for pricing lookups.
    pub model: String,
    /// OpenAI-compatible chat completions base URL.
    pub base_url: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    pub cost_tier: CostTier,
    /// Providers with contractual zero-retention / no-training guarantees.
    /// Sensitive fragments are preferentially routed here.
    pub strict_data_handling: bool,
}

/// Tuning knobs for a pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub providers: Vec<ProviderProfile>,
    /// Retries per provider call on transient failure.
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries.
    pub retry_base_delay: Duration,
    /// HTTP deadline for one provider attempt. Must leave the fragment
    /// deadline room for the full retry budget, or a slow attempt eats the
    /// retries that a timeout is supposed to trigger.
    pub attempt_timeout: Duration,
    /// Deadline for a single fragment's provider call (including retries).
    pub fragment_timeout: Duration,
    /// Deadline for the whole request.
    pub request_timeout: Duration,
    /// How long finished request state stays fetchable.
    pub state_ttl: Duration,
    pub max_tokens_per_fragment: u32,
    pub temperature: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            providers: default_providers(),
            max_retries: 2,
            retry_base_delay: Duration::from_secs(1),
            attempt_timeout: Duration::from_secs(12),
            fragment_timeout: Duration::from_secs(45),
            request_timeout: Duration::from_secs(180),
            state_ttl: Duration::from_secs(15 * 60),
            max_tokens_per_fragment: 1024,
            temperature: 0.3,
        }
    }
}

impl PipelineConfig {
    /// Build a config from environment overrides on top of defaults.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(n) = env_parse::<u32>("VEILSPLIT_MAX_RETRIES") {
            cfg.max_retries = n;
        }
        if let Some(secs) = env_parse::<u64>("VEILSPLIT_ATTEMPT_TIMEOUT_SECONDS") {
            cfg.attempt_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("VEILSPLIT_FRAGMENT_TIMEOUT_SECONDS") {
            cfg.fragment_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("VEILSPLIT_REQUEST_TIMEOUT_SECONDS") {
            cfg.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("VEILSPLIT_STATE_TTL_SECONDS") {
            cfg.state_ttl = Duration::from_secs(secs);
        }

        cfg
    }

    pub fn provider(&self, id: &str) -> Option<&ProviderProfile> {
        self.providers.iter().find(|p| p.id == id)
    }

    /// Providers with strict data-handling guarantees, in table order.
    pub fn strict_providers(&self) -> Vec<&ProviderProfile> {
        self.providers
            .iter()
            .filter(|p| p.strict_data_handling)
            .collect()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

fn default_providers() -> Vec<ProviderProfile> {
    vec![
        ProviderProfile {
            id: "openai".into(),
            model: "gpt-4o-mini".into(),
            base_url: "https://api.openai.com/v1".into(),
            api_key_env: "OPENAI_API_KEY".into(),
            cost_tier: CostTier::Economy,
            strict_data_handling: false,
        },
        ProviderProfile {
            id: "anthropic".into(),
            model: "claude-3-5-sonnet".into(),
            base_url: "https://api.anthropic.com/v1".into(),
            api_key_env: "ANTHROPIC_API_KEY".into(),
            cost_tier: CostTier::Premium,
            strict_data_handling: true,
        },
        ProviderProfile {
            id: "google".into(),
            model: "gemini-2.0-flash".into(),
            base_url: "https://generativelanguage.googleapis.com/v1beta/openai".into(),
            api_key_env: "GEMINI_API_KEY".into(),
            cost_tier: CostTier::Standard,
            strict_data_handling: false,
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table_has_three_providers_and_one_strict() {
        let cfg = PipelineConfig::default();
        assert_eq!(cfg.providers.len(), 3);
        assert_eq!(cfg.strict_providers().len(), 1);
        assert_eq!(cfg.strict_providers()[0].id, "anthropic");
    }

    #[test]
    fn provider_lookup_by_id() {
        let cfg = PipelineConfig::default();
        assert!(cfg.provider("openai").is_some());
        assert!(cfg.provider("nope").is_none());
    }

    #[test]
    fn retry_budget_fits_inside_the_fragment_deadline() {
        let cfg = PipelineConfig::default();
        let attempts = cfg.max_retries + 1;
        // Worst-case backoff between attempts, including the 1.2x jitter.
        let backoff: Duration = (0..cfg.max_retries)
            .map(|a| cfg.retry_base_delay.mul_f64(2f64.powi(a as i32) * 1.2))
            .sum();
        assert!(cfg.attempt_timeout * attempts + backoff <= cfg.fragment_timeout);
    }

    #[test]
    fn cost_tier_ordering() {
        assert!(CostTier::Economy < CostTier::Standard);
        assert!(CostTier::Standard < CostTier::Premium);
    }
}
