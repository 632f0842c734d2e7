use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use steward_core_types::ModelRef;

pub const DEFAULT_OUTPUT_TOKEN_MAX: u64 = 32_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct CompactionConfig {
    /// Summarize automatically when the context window overflows
    pub auto: bool,
    /// Clear stale tool outputs after each turn
    pub prune: bool,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            auto: true,
            prune: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ExperimentalConfig {
    /// Keep looping after the user rejects a tool call
    pub continue_loop_on_deny: bool,
    pub output_token_max: u64,
}

impl Default for ExperimentalConfig {
    fn default() -> Self {
        Self {
            continue_loop_on_deny: false,
            output_token_max: DEFAULT_OUTPUT_TOKEN_MAX,
        }
    }
}

/// Per-agent overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct AgentConfig {
    /// `provider/model`
    pub model: Option<String>,
    pub max_steps: Option<u32>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
    pub prompt: Option<String>,
    pub description: Option<String>,
}

impl AgentConfig {
    pub fn model_ref(&self) -> Option<ModelRef> {
        let model = self.model.as_deref()?;
        let (provider, id) = model.split_once('/')?;
        if provider.is_empty() || id.is_empty() {
            return None;
        }
        Some(ModelRef::new(provider, id))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct CoreConfig {
    pub compaction: CompactionConfig,
    pub experimental: ExperimentalConfig,
    pub agents: BTreeMap<String, AgentConfig>,
}
