//! Model pricing registry.
//!
//! Centralized pricing data for the configured provider models.
//! Costs are in nanodollars (1e-9 USD) per token.

use std::collections::HashMap;
use std::sync::OnceLock;

/// Pricing information for a model.
#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    /// Cost per input token in nanodollars.
    pub input_nanos_per_token: i64,
    /// Cost per output token in nanodollars.
    pub output_nanos_per_token: i64,
}

impl ModelPricing {
    const fn new(input: i64, output: i64) -> Self {
        Self {
            input_nanos_per_token: input,
            output_nanos_per_token: output,
        }
    }

    /// Calculate cost for a request.
    pub fn calculate_cost(&self, input_tokens: u32, output_tokens: u32) -> i64 {
        (input_tokens as i64) * self.input_nanos_per_token
            + (output_tokens as i64) * self.output_nanos_per_token
    }
}

// =============================================================================
// PRICING DATA
// =============================================================================

// Verify periodically against provider pricing pages.
// GPT-4o-mini: $0.15/1M input, $0.60/1M output
// Claude 3.5 Sonnet: $3.00/1M input, $15.00/1M output
// Gemini 2.0 Flash: $0.10/1M input, $0.40/1M output

const GPT_4O_MINI: ModelPricing = ModelPricing::new(150, 600);
const CLAUDE_35_SONNET: ModelPricing = ModelPricing::new(3_000, 15_000);
const GEMINI_20_FLASH: ModelPricing = ModelPricing::new(100, 400);

/// Reference premium model for the cost comparison: what the same token
/// volume would cost if the whole query went to a single top-tier provider.
/// Claude Opus class: $5.00/1M input, $25.00/1M output.
pub const REFERENCE_PREMIUM: ModelPricing = ModelPricing::new(5_000, 25_000);

static PRICING_MAP: OnceLock<HashMap<&'static str, ModelPricing>> = OnceLock::new();

fn init_pricing() -> HashMap<&'static str, ModelPricing> {
    let mut map = HashMap::new();

    map.insert("gpt-4o-mini", GPT_4O_MINI);
    map.insert("gpt-4o-mini-2024-07-18", GPT_4O_MINI);
    map.insert("claude-3-5-sonnet", CLAUDE_35_SONNET);
    map.insert("claude-3-5-sonnet-20241022", CLAUDE_35_SONNET);
    map.insert("gemini-2.0-flash", GEMINI_20_FLASH);

    map
}

/// Get pricing for a model.
pub fn get_pricing(model_id: &str) -> Option<ModelPricing> {
    let map = PRICING_MAP.get_or_init(init_pricing);
    map.get(model_id).copied()
}

/// Calculate generation cost for a model.
pub fn generation_cost(model: &str, input_tokens: u32, output_tokens: u32) -> i64 {
    // Default to a mid-range model if unknown
    let default = ModelPricing::new(1_000, 5_000);
    let pricing = get_pricing(model).unwrap_or(default);
    pricing.calculate_cost(input_tokens, output_tokens)
}

/// What the same token volume would cost on the reference premium model.
pub fn premium_reference_cost(input_tokens: u32, output_tokens: u32) -> i64 {
    REFERENCE_PREMIUM.calculate_cost(input_tokens, output_tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_cost() {
        // 1K input + 1K output for gpt-4o-mini
        // Input: 1000 * 150 = 150,000 nanos
        // Output: 1000 * 600 = 600,000 nanos
        let cost = generation_cost("gpt-4o-mini", 1_000, 1_000);
        assert_eq!(cost, 750_000);
    }

    #[test]
    fn test_unknown_model_uses_default() {
        let cost = generation_cost("mystery-model", 1_000, 0);
        assert_eq!(cost, 1_000_000);
    }

    #[test]
    fn test_premium_reference_is_most_expensive() {
        let premium = premium_reference_cost(1_000, 1_000);
        for model in ["gpt-4o-mini", "claude-3-5-sonnet", "gemini-2.0-flash"] {
            assert!(premium > generation_cost(model, 1_000, 1_000), "{model}");
        }
    }
}
