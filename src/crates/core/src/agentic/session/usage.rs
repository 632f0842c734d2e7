//! Token accounting and cost for one step

use crate::infrastructure::ai::{ModelInfo, ProviderUsage};
use serde_json::Value;
use steward_core_types::{CacheUsage, TokenUsage};

const OVER_200K_THRESHOLD: u64 = 200_000;
const PER_MILLION: f64 = 1_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepUsage {
    pub tokens: TokenUsage,
    pub cost: f64,
}

fn finite(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

fn metadata_u64(metadata: Option<&Value>, path: &[&str]) -> Option<u64> {
    let mut current = metadata?;
    for segment in path {
        current = current.get(segment)?;
    }
    current.as_u64()
}

/// Normalizes provider usage into stored token counts and a USD cost.
///
/// Anthropic and Bedrock report input tokens without the cached portion;
/// other providers include it, so it is subtracted there.
pub fn step_usage(model: &ModelInfo, usage: &ProviderUsage, metadata: Option<&Value>) -> StepUsage {
    let cache_read = usage.cached_input_tokens;
    let cache_write = metadata_u64(metadata, &["anthropic", "cacheCreationInputTokens"])
        .or_else(|| metadata_u64(metadata, &["bedrock", "usage", "cacheWriteInputTokens"]))
        .unwrap_or(0);

    let excludes_cached = metadata
        .is_some_and(|m| m.get("anthropic").is_some() || m.get("bedrock").is_some());
    let input = if excludes_cached {
        usage.input_tokens
    } else {
        usage.input_tokens.saturating_sub(cache_read)
    };

    let tokens = TokenUsage {
        input,
        output: usage.output_tokens,
        reasoning: usage.reasoning_tokens,
        cache: CacheUsage {
            read: cache_read,
            write: cache_write,
        },
    };

    let rates = match model.cost.over_200k {
        Some(tier) if tokens.input + tokens.cache.read > OVER_200K_THRESHOLD => tier,
        _ => model.cost.base,
    };
    let cost = tokens.input as f64 * rates.input / PER_MILLION
        + tokens.output as f64 * rates.output / PER_MILLION
        + tokens.cache.read as f64 * rates.cache_read / PER_MILLION
        + tokens.cache.write as f64 * rates.cache_write / PER_MILLION
        // Reasoning is billed at the output rate.
        + tokens.reasoning as f64 * rates.output / PER_MILLION;

    StepUsage {
        tokens,
        cost: finite(cost),
    }
}
