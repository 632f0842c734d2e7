//! Plugin hooks
//!
//! Plugins are an ordered capability list. Each hook runs on every plugin
//! in registration order, and each plugin sees the output left by the ones
//! before it. The first error aborts the call site.

use crate::agentic::permission::{PermissionDecision, PermissionRequest};
use crate::infrastructure::ai::{ChatParams, ModelInfo};
use crate::util::errors::{StewardError, StewardResult};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, RwLock};
use steward_core_types::ToolCompletion;

#[derive(Debug, Clone)]
pub struct ChatParamsInput {
    pub session_id: String,
    pub agent: String,
    pub model: ModelInfo,
}

#[derive(Debug, Clone)]
pub struct TextCompleteInput {
    pub session_id: String,
    pub message_id: String,
    pub part_id: String,
}

/// What the `session.compacting` hook may change about the summary request.
#[derive(Debug, Clone, Default)]
pub struct CompactingOutput {
    /// Appended after the default prompt
    pub context: Vec<String>,
    /// Replaces the default prompt (and context) entirely
    pub prompt: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ToolHookInput {
    pub tool: String,
    pub session_id: String,
    pub call_id: String,
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    async fn permission_ask(
        &self,
        _request: &PermissionRequest,
        _decision: &mut PermissionDecision,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn chat_params(
        &self,
        _input: &ChatParamsInput,
        _params: &mut ChatParams,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn text_complete(
        &self,
        _input: &TextCompleteInput,
        _text: &mut String,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn session_compacting(
        &self,
        _session_id: &str,
        _output: &mut CompactingOutput,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn tool_execute_before(
        &self,
        _input: &ToolHookInput,
        _args: &mut Value,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn tool_execute_after(
        &self,
        _input: &ToolHookInput,
        _output: &mut ToolCompletion,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct HookRegistry {
    plugins: RwLock<Vec<Arc<dyn Plugin>>>,
}

fn hook_error(plugin: &dyn Plugin, hook: &str, err: anyhow::Error) -> StewardError {
    StewardError::hook(format!("{} failed in {}: {:#}", plugin.name(), hook, err))
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, plugin: Arc<dyn Plugin>) {
        log::debug!("Plugin registered: name={}", plugin.name());
        self.plugins
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(plugin);
    }

    fn snapshot(&self) -> Vec<Arc<dyn Plugin>> {
        self.plugins
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub async fn permission_ask(&self, request: &PermissionRequest) -> StewardResult<PermissionDecision> {
        let mut decision = PermissionDecision::Ask;
        for plugin in self.snapshot() {
            plugin
                .permission_ask(request, &mut decision)
                .await
                .map_err(|e| hook_error(plugin.as_ref(), "permission.ask", e))?;
        }
        Ok(decision)
    }

    pub async fn chat_params(&self, input: &ChatParamsInput, params: &mut ChatParams) -> StewardResult<()> {
        for plugin in self.snapshot() {
            plugin
                .chat_params(input, params)
                .await
                .map_err(|e| hook_error(plugin.as_ref(), "chat.params", e))?;
        }
        Ok(())
    }

    pub async fn text_complete(&self, input: &TextCompleteInput, text: &mut String) -> StewardResult<()> {
        for plugin in self.snapshot() {
            plugin
                .text_complete(input, text)
                .await
                .map_err(|e| hook_error(plugin.as_ref(), "text.complete", e))?;
        }
        Ok(())
    }

    pub async fn session_compacting(&self, session_id: &str) -> StewardResult<CompactingOutput> {
        let mut output = CompactingOutput::default();
        for plugin in self.snapshot() {
            plugin
                .session_compacting(session_id, &mut output)
                .await
                .map_err(|e| hook_error(plugin.as_ref(), "session.compacting", e))?;
        }
        Ok(output)
    }

    pub async fn tool_execute_before(&self, input: &ToolHookInput, args: &mut Value) -> StewardResult<()> {
        for plugin in self.snapshot() {
            plugin
                .tool_execute_before(input, args)
                .await
                .map_err(|e| hook_error(plugin.as_ref(), "tool.execute.before", e))?;
        }
        Ok(())
    }

    pub async fn tool_execute_after(
        &self,
        input: &ToolHookInput,
        output: &mut ToolCompletion,
    ) -> StewardResult<()> {
        for plugin in self.snapshot() {
            plugin
                .tool_execute_after(input, output)
                .await
                .map_err(|e| hook_error(plugin.as_ref(), "tool.execute.after", e))?;
        }
        Ok(())
    }
}
