use super::framework::Tool;
use crate::util::wildcard;
use indexmap::IndexMap;
use log::debug;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use steward_core_types::{PermissionAction, PermissionRule};

/// Named tools in registration order.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<IndexMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `tool`, replacing any tool with the same name.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        debug!("Tool registered: name={}", name);
        self.tools
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Tools offered for one turn. A tool is dropped when the turn toggles it
    /// off, or when a session rule denies it outright (pattern `*`).
    pub fn resolve(
        &self,
        toggles: &BTreeMap<String, bool>,
        rules: &[PermissionRule],
    ) -> Vec<Arc<dyn Tool>> {
        let tools = self.tools.read().unwrap_or_else(|e| e.into_inner());
        tools
            .iter()
            .filter(|(name, _)| toggles.get(name.as_str()).copied().unwrap_or(true))
            .filter(|(name, _)| !denied(name, rules))
            .map(|(_, tool)| tool.clone())
            .collect()
    }
}

/// The last matching rule wins.
fn denied(tool: &str, rules: &[PermissionRule]) -> bool {
    rules
        .iter()
        .rev()
        .find(|rule| wildcard::matches(tool, &rule.permission) && rule.pattern == "*")
        .is_some_and(|rule| rule.action == PermissionAction::Deny)
}
