//! Tool contract and per-call execution context

use crate::agentic::permission::{AskInput, PermissionGate};
use crate::agentic::session::SessionManager;
use crate::infrastructure::ai::ToolDefinition;
use crate::util::errors::StewardResult;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use steward_core_types::{PartData, ToolCompletion, ToolState};
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> String;

    /// JSON schema of the arguments
    fn parameters(&self) -> Value;

    async fn execute(&self, args: Value, ctx: ToolContext) -> StewardResult<ToolCompletion>;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description(),
            parameters: self.parameters(),
        }
    }
}

/// Handed to [`Tool::execute`] for one call.
#[derive(Clone)]
pub struct ToolContext {
    pub session_id: String,
    pub message_id: String,
    pub part_id: String,
    pub call_id: String,
    pub agent: String,
    pub cancel: CancellationToken,
    permission: Arc<PermissionGate>,
    sessions: Arc<SessionManager>,
}

impl ToolContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: impl Into<String>,
        message_id: impl Into<String>,
        part_id: impl Into<String>,
        call_id: impl Into<String>,
        agent: impl Into<String>,
        cancel: CancellationToken,
        permission: Arc<PermissionGate>,
        sessions: Arc<SessionManager>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            message_id: message_id.into(),
            part_id: part_id.into(),
            call_id: call_id.into(),
            agent: agent.into(),
            cancel,
            permission,
            sessions,
        }
    }

    /// Blocks until the user approves. Fails with a rejection or on cancel.
    pub async fn ask(
        &self,
        permission_type: impl Into<String>,
        pattern: Option<Vec<String>>,
        message: impl Into<String>,
        metadata: Value,
    ) -> StewardResult<()> {
        self.permission
            .ask(
                AskInput {
                    permission_type: permission_type.into(),
                    pattern,
                    session_id: self.session_id.clone(),
                    message_id: self.message_id.clone(),
                    call_id: Some(self.call_id.clone()),
                    message: message.into(),
                    metadata,
                },
                &self.cancel,
            )
            .await
    }

    /// Publishes progress on the running tool part. Ignored once the part
    /// left the running state.
    pub async fn metadata(&self, title: Option<String>, metadata: Value) -> StewardResult<()> {
        let mut part = self.sessions.get_part(&self.message_id, &self.part_id).await?;
        if let PartData::Tool {
            state: ToolState::Running {
                title: current_title,
                metadata: current_metadata,
                ..
            },
            ..
        } = &mut part.data
        {
            if title.is_some() {
                *current_title = title;
            }
            *current_metadata = Some(metadata);
            self.sessions.update_part(&part, None).await?;
        }
        Ok(())
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }
}
