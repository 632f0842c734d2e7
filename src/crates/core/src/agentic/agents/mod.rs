//! Agent definitions
//!
//! Built-in agents plus per-agent overrides from [`CoreConfig`].

use crate::service::config::{AgentConfig, CoreConfig};
use crate::util::errors::{StewardError, StewardResult};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use steward_core_types::ModelRef;

pub const BUILD_AGENT: &str = "build";
pub const GENERAL_AGENT: &str = "general";
pub const COMPACTION_AGENT: &str = "compaction";
pub const TITLE_AGENT: &str = "title";

const TITLE_PROMPT: &str = "You are a title generator. Reply with a single line of at most 50 characters that names the topic of the conversation. No quotes, no punctuation at the end, no explanations.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentMode {
    Primary,
    Subagent,
    All,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub name: String,
    pub description: String,
    pub mode: AgentMode,
    /// Internal agents are never offered to the user
    pub hidden: bool,
    pub model: Option<ModelRef>,
    pub prompt: Option<String>,
    pub max_steps: Option<u32>,
    pub temperature: Option<f64>,
    pub top_p: Option<f64>,
}

impl AgentInfo {
    fn builtin(name: &str, description: &str, mode: AgentMode, hidden: bool) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            mode,
            hidden,
            model: None,
            prompt: None,
            max_steps: None,
            temperature: None,
            top_p: None,
        }
    }

    fn apply(&mut self, config: &AgentConfig) {
        if let Some(model) = config.model_ref() {
            self.model = Some(model);
        }
        if let Some(description) = &config.description {
            self.description = description.clone();
        }
        self.prompt = config.prompt.clone().or(self.prompt.take());
        self.max_steps = config.max_steps.or(self.max_steps);
        self.temperature = config.temperature.or(self.temperature);
        self.top_p = config.top_p.or(self.top_p);
    }
}

pub struct AgentRegistry {
    agents: IndexMap<String, AgentInfo>,
}

impl AgentRegistry {
    pub fn from_config(config: &CoreConfig) -> Self {
        let mut agents = IndexMap::new();
        for agent in [
            AgentInfo::builtin(
                BUILD_AGENT,
                "Default agent with every tool enabled",
                AgentMode::Primary,
                false,
            ),
            AgentInfo::builtin(
                GENERAL_AGENT,
                "General-purpose agent for delegated multi-step tasks",
                AgentMode::Subagent,
                false,
            ),
            AgentInfo::builtin(
                COMPACTION_AGENT,
                "Summarizes the conversation when the context window fills up",
                AgentMode::Primary,
                true,
            ),
            AgentInfo {
                prompt: Some(TITLE_PROMPT.to_string()),
                ..AgentInfo::builtin(TITLE_AGENT, "Generates session titles", AgentMode::Primary, true)
            },
        ] {
            agents.insert(agent.name.clone(), agent);
        }

        for (name, overrides) in &config.agents {
            agents
                .entry(name.clone())
                .or_insert_with(|| AgentInfo::builtin(name, "", AgentMode::All, false))
                .apply(overrides);
        }
        Self { agents }
    }

    pub fn get(&self, name: &str) -> StewardResult<AgentInfo> {
        self.agents
            .get(name)
            .cloned()
            .ok_or_else(|| StewardError::not_found(format!("Agent not found: {}", name)))
    }

    pub fn list(&self) -> Vec<AgentInfo> {
        self.agents.values().cloned().collect()
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::from_config(&CoreConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_overrides_builtins_and_adds_agents() {
        let mut config = CoreConfig::default();
        config.agents.insert(
            BUILD_AGENT.to_string(),
            AgentConfig {
                max_steps: Some(3),
                model: Some("openai/gpt".to_string()),
                ..Default::default()
            },
        );
        config.agents.insert(
            "reviewer".to_string(),
            AgentConfig {
                prompt: Some("Review carefully".to_string()),
                ..Default::default()
            },
        );

        let registry = AgentRegistry::from_config(&config);
        let build = registry.get(BUILD_AGENT).unwrap();
        assert_eq!(build.max_steps, Some(3));
        assert_eq!(build.model, Some(ModelRef::new("openai", "gpt")));
        assert_eq!(
            registry.get("reviewer").unwrap().prompt.as_deref(),
            Some("Review carefully")
        );
        assert!(registry.get("missing").unwrap_err().is_not_found());
        assert!(registry.get(COMPACTION_AGENT).unwrap().hidden);
    }
}
