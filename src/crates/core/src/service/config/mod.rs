//! Core configuration
//!
//! Loaded from TOML or JSON (picked by file extension), then adjusted by
//! `STEWARD_*` environment overrides.

pub mod types;

pub use types::*;

use crate::util::errors::{StewardError, StewardResult};
use log::{debug, warn};
use std::path::Path;

pub const ENV_OUTPUT_TOKEN_MAX: &str = "STEWARD_OUTPUT_TOKEN_MAX";
pub const ENV_DISABLE_AUTOCOMPACT: &str = "STEWARD_DISABLE_AUTOCOMPACT";
pub const ENV_DISABLE_PRUNE: &str = "STEWARD_DISABLE_PRUNE";

impl CoreConfig {
    pub fn from_toml_str(content: &str) -> StewardResult<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_json_str(content: &str) -> StewardResult<Self> {
        serde_json::from_str(content)
            .map_err(|e| StewardError::config(format!("Invalid JSON config: {}", e)))
    }

    /// Reads `path` and applies environment overrides.
    pub async fn load(path: impl AsRef<Path>) -> StewardResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            StewardError::config(format!("Failed to read config {}: {}", path.display(), e))
        })?;
        let mut config = match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&content)?,
            Some("json") => Self::from_json_str(&content)?,
            other => {
                return Err(StewardError::config(format!(
                    "Unsupported config format: {:?}",
                    other
                )))
            }
        };
        config.apply_env_overrides();
        debug!("Config loaded: path={}", path.display());
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_with(|key| std::env::var(key).ok());
    }

    /// Applies overrides from an arbitrary lookup.
    pub fn apply_overrides_with(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup(ENV_OUTPUT_TOKEN_MAX) {
            match value.trim().parse::<u64>() {
                Ok(max) if max > 0 => self.experimental.output_token_max = max,
                _ => warn!(
                    "Ignoring invalid override: key={}, value={}",
                    ENV_OUTPUT_TOKEN_MAX, value
                ),
            }
        }
        if lookup(ENV_DISABLE_AUTOCOMPACT).is_some_and(|v| is_truthy(&v)) {
            self.compaction.auto = false;
        }
        if lookup(ENV_DISABLE_PRUNE).is_some_and(|v| is_truthy(&v)) {
            self.compaction.prune = false;
        }
    }

    pub fn agent(&self, name: &str) -> Option<&AgentConfig> {
        self.agents.get(name)
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_apply_to_missing_sections() {
        let config = CoreConfig::from_toml_str("").unwrap();
        assert!(config.compaction.auto);
        assert!(config.compaction.prune);
        assert!(!config.experimental.continue_loop_on_deny);
        assert_eq!(config.experimental.output_token_max, DEFAULT_OUTPUT_TOKEN_MAX);
    }

    #[test]
    fn toml_and_json_agree() {
        let toml = r#"
            [compaction]
            prune = false

            [experimental]
            continue_loop_on_deny = true

            [agents.build]
            model = "anthropic/claude"
            max_steps = 5
        "#;
        let json = r#"{
            "compaction": {"prune": false},
            "experimental": {"continue_loop_on_deny": true},
            "agents": {"build": {"model": "anthropic/claude", "max_steps": 5}}
        }"#;
        let a = CoreConfig::from_toml_str(toml).unwrap();
        let b = CoreConfig::from_json_str(json).unwrap();
        assert_eq!(a, b);
        assert!(a.compaction.auto);
        let build = a.agent("build").unwrap();
        assert_eq!(build.max_steps, Some(5));
        assert_eq!(build.model_ref().unwrap().model_id, "claude");
    }

    #[test]
    fn env_overrides() {
        let env: HashMap<&str, &str> = [
            (ENV_OUTPUT_TOKEN_MAX, "16000"),
            (ENV_DISABLE_AUTOCOMPACT, "true"),
            (ENV_DISABLE_PRUNE, "0"),
        ]
        .into_iter()
        .collect();
        let mut config = CoreConfig::default();
        config.apply_overrides_with(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.experimental.output_token_max, 16_000);
        assert!(!config.compaction.auto);
        assert!(config.compaction.prune);
    }

    #[tokio::test]
    async fn load_picks_format_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("steward.toml");
        tokio::fs::write(&path, "[experimental]\noutput_token_max = 1000\n")
            .await
            .unwrap();
        let config = CoreConfig::load(&path).await.unwrap();
        assert!(config.experimental.output_token_max > 0);

        let bad = dir.path().join("steward.yaml");
        tokio::fs::write(&bad, "x: 1").await.unwrap();
        assert!(CoreConfig::load(&bad).await.is_err());
    }
}
