//! Stream processor
//!
//! Drives one inference stream to completion: persists text, reasoning and
//! tool parts as events arrive, executes tool calls, records usage, and
//! retries transient provider failures.

use super::retry;
use crate::agentic::agents::AgentInfo;
use crate::agentic::events::CoreEvent;
use crate::agentic::hooks::{TextCompleteInput, ToolHookInput};
use crate::agentic::permission::AskInput;
use crate::agentic::runtime::AgentRuntime;
use crate::agentic::session::{compaction, summary, usage};
use crate::agentic::tools::{Tool, ToolContext};
use crate::infrastructure::ai::{
    ChatParams, ModelInfo, ModelMessage, ProviderError, ProviderToolOutput, StreamEvent,
    StreamRequest,
};
use crate::util::errors::{StewardError, StewardResult};
use crate::util::identifier::{ascending, IdPrefix};
use futures::StreamExt;
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use steward_core_types::{
    AssistantMessage, MessageError, MessageInfo, Part, PartData, PartTime, SessionStatus,
    ToolCompletion, ToolState, UserMessage,
};
use tokio_util::sync::CancellationToken;

/// Identical consecutive tool calls tolerated before asking the user
pub const DOOM_LOOP_THRESHOLD: usize = 3;
const TOOL_ABORTED: &str = "Tool execution aborted";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Continue,
    Compact,
    Stop,
}

/// Everything one inference call needs.
pub struct StreamInput {
    pub user: UserMessage,
    pub agent: AgentInfo,
    pub system: Vec<String>,
    pub messages: Vec<ModelMessage>,
    pub tools: Vec<Arc<dyn Tool>>,
    pub params: ChatParams,
    pub cancel: CancellationToken,
}

pub struct StreamProcessor {
    runtime: AgentRuntime,
    assistant: AssistantMessage,
    model: ModelInfo,
    /// Tool parts by call id, kept across retries
    tool_parts: HashMap<String, Part>,
    snapshot: Option<String>,
    blocked: bool,
    attempt: u32,
    needs_compaction: bool,
}

impl StreamProcessor {
    pub fn new(runtime: AgentRuntime, assistant: AssistantMessage, model: ModelInfo) -> Self {
        Self {
            runtime,
            assistant,
            model,
            tool_parts: HashMap::new(),
            snapshot: None,
            blocked: false,
            attempt: 0,
            needs_compaction: false,
        }
    }

    pub fn message(&self) -> &AssistantMessage {
        &self.assistant
    }

    pub async fn process(&mut self, input: &StreamInput) -> StewardResult<ProcessOutcome> {
        info!(
            "Stream processing started: session_id={}, message_id={}, model={}/{}",
            self.assistant.session_id, self.assistant.id, self.model.provider_id, self.model.id
        );
        self.needs_compaction = false;

        loop {
            if let Err(err) = self.run_stream(input).await {
                let message_error = self.message_error(&err, &input.cancel);
                error!(
                    "Stream processing failed: session_id={}, message_id={}, error={}",
                    self.assistant.session_id, self.assistant.id, err
                );

                let retry_message = if input.cancel.is_cancelled() {
                    None
                } else {
                    retry::retryable(&message_error)
                };
                match retry_message {
                    Some(status_message) => {
                        if self.wait_for_retry(&message_error, status_message, &input.cancel).await? {
                            continue;
                        }
                        self.record_error(ProviderError::Aborted.to_message_error());
                    }
                    None => self.record_error(message_error),
                }
            }

            self.cleanup().await?;
            return Ok(self.outcome());
        }
    }

    fn outcome(&self) -> ProcessOutcome {
        if self.needs_compaction {
            ProcessOutcome::Compact
        } else if self.blocked || self.assistant.error.is_some() {
            ProcessOutcome::Stop
        } else {
            ProcessOutcome::Continue
        }
    }

    fn message_error(&self, err: &StewardError, cancel: &CancellationToken) -> MessageError {
        if cancel.is_cancelled() || err.is_cancelled() {
            return ProviderError::Aborted.to_message_error();
        }
        match err {
            StewardError::Provider(provider) => provider.to_message_error(),
            other => MessageError::Unknown {
                message: other.to_string(),
            },
        }
    }

    fn record_error(&mut self, error: MessageError) {
        self.assistant.error = Some(error.clone());
        self.runtime.events.publish(CoreEvent::SessionError {
            session_id: Some(self.assistant.session_id.clone()),
            error,
        });
    }

    /// Returns `false` when the wait was cancelled.
    async fn wait_for_retry(
        &mut self,
        error: &MessageError,
        status_message: String,
        cancel: &CancellationToken,
    ) -> StewardResult<bool> {
        self.attempt += 1;
        let api = match error {
            MessageError::Api(data) => Some(data),
            _ => None,
        };
        let delay = retry::delay(self.attempt, api);
        let now = chrono::Utc::now().timestamp_millis();
        warn!(
            "Retrying stream: session_id={}, attempt={}, delay_ms={}, reason={}",
            self.assistant.session_id, self.attempt, delay, status_message
        );
        self.runtime.status.set(
            &self.assistant.session_id,
            SessionStatus::Retry {
                attempt: self.attempt,
                message: status_message,
                next: now.saturating_add(i64::try_from(delay).unwrap_or(i64::MAX)),
            },
        );
        self.write_part(PartData::Retry {
            attempt: self.attempt,
            error: error.clone(),
            created: now,
        })
        .await?;
        Ok(retry::sleep(delay, cancel).await.is_ok())
    }

    async fn run_stream(&mut self, input: &StreamInput) -> StewardResult<()> {
        let request = StreamRequest {
            session_id: self.assistant.session_id.clone(),
            model: self.model.clone(),
            system: input.system.clone(),
            messages: input.messages.clone(),
            tools: input.tools.iter().map(|t| t.definition()).collect(),
            params: input.params.clone(),
        };
        let mut stream = self
            .runtime
            .provider
            .stream(request, input.cancel.clone())
            .await?;

        let mut text: Option<Part> = None;
        let mut reasoning: HashMap<String, Part> = HashMap::new();

        loop {
            let event = tokio::select! {
                _ = input.cancel.cancelled() => {
                    return Err(StewardError::cancelled("Stream aborted"));
                }
                event = stream.next() => event,
            };
            let Some(event) = event else { break };
            debug!(
                "Stream event: message_id={}, event={}",
                self.assistant.id,
                event.name()
            );

            match event {
                StreamEvent::Start => {
                    self.runtime
                        .status
                        .set(&self.assistant.session_id, SessionStatus::Busy);
                }

                StreamEvent::ReasoningStart { id, metadata } => {
                    if !reasoning.contains_key(&id) {
                        let part = self.new_part(PartData::Reasoning {
                            text: String::new(),
                            time: PartTime {
                                start: chrono::Utc::now().timestamp_millis(),
                                end: None,
                            },
                            metadata,
                        });
                        reasoning.insert(id, part);
                    }
                }

                StreamEvent::ReasoningDelta { id, text: delta, metadata } => {
                    if let Some(part) = reasoning.get_mut(&id) {
                        if append_text(part, &delta, metadata) {
                            self.runtime.sessions.update_part(part, Some(delta)).await?;
                        }
                    }
                }

                StreamEvent::ReasoningEnd { id, metadata } => {
                    if let Some(part) = reasoning.remove(&id) {
                        self.finish_reasoning(part, metadata).await?;
                    }
                }

                StreamEvent::TextStart { metadata } => {
                    if let Some(open) = text.take() {
                        self.finish_text(open, None).await?;
                    }
                    text = Some(self.new_text_part(metadata));
                }

                StreamEvent::TextDelta { text: delta, metadata } => {
                    let part = text.get_or_insert_with(|| self.new_text_part(None));
                    if append_text(part, &delta, metadata) {
                        self.runtime.sessions.update_part(part, Some(delta)).await?;
                    }
                }

                StreamEvent::TextEnd { metadata } => {
                    if let Some(open) = text.take() {
                        self.finish_text(open, metadata).await?;
                    }
                }

                StreamEvent::ToolInputStart { id, tool_name } => {
                    let part_id = self
                        .tool_parts
                        .get(&id)
                        .map(|p| p.id.clone())
                        .unwrap_or_else(|| ascending(IdPrefix::Part));
                    let part = Part {
                        id: part_id,
                        session_id: self.assistant.session_id.clone(),
                        message_id: self.assistant.id.clone(),
                        data: PartData::Tool {
                            call_id: id.clone(),
                            tool: tool_name,
                            state: ToolState::pending(),
                            metadata: None,
                        },
                    };
                    self.runtime.sessions.update_part(&part, None).await?;
                    self.tool_parts.insert(id, part);
                }

                StreamEvent::ToolInputDelta { .. } | StreamEvent::ToolInputEnd { .. } => {}

                StreamEvent::ToolCall {
                    call_id,
                    tool_name,
                    input: args,
                    provider_executed,
                } => {
                    self.handle_tool_call(call_id, tool_name, args, provider_executed, input)
                        .await?;
                }

                StreamEvent::ToolResult { call_id, output } => {
                    self.handle_provider_tool_result(&call_id, Ok(output)).await?;
                }

                StreamEvent::ToolError { call_id, error } => {
                    self.handle_provider_tool_result(&call_id, Err(error)).await?;
                }

                StreamEvent::StartStep => {
                    self.snapshot = self.runtime.snapshot.track().await?;
                    self.write_part(PartData::StepStart {
                        snapshot: self.snapshot.clone(),
                    })
                    .await?;
                }

                StreamEvent::FinishStep {
                    finish_reason,
                    usage: provider_usage,
                    provider_metadata,
                } => {
                    let step =
                        usage::step_usage(&self.model, &provider_usage, provider_metadata.as_ref());
                    self.assistant.finish = Some(finish_reason.clone());
                    self.assistant.cost += step.cost;
                    self.assistant.tokens = step.tokens;

                    let snapshot = self.runtime.snapshot.track().await?;
                    self.write_part(PartData::StepFinish {
                        reason: finish_reason,
                        snapshot,
                        cost: step.cost,
                        tokens: step.tokens,
                    })
                    .await?;
                    self.persist_message().await?;
                    self.emit_patch().await?;

                    summary::spawn_summarize(
                        self.runtime.clone(),
                        self.assistant.session_id.clone(),
                        self.assistant.parent_id.clone(),
                    );
                    if compaction::is_overflow(&step.tokens, &self.model, &self.runtime.config) {
                        info!(
                            "Context overflow detected: session_id={}, message_id={}",
                            self.assistant.session_id, self.assistant.id
                        );
                        self.needs_compaction = true;
                    }
                }

                StreamEvent::Finish { finish_reason } => {
                    if self.assistant.finish.is_none() {
                        self.assistant.finish = finish_reason;
                    }
                }

                StreamEvent::Error(err) => return Err(StewardError::Provider(err)),
            }

            if self.needs_compaction {
                break;
            }
        }

        if let Some(open) = text.take() {
            self.finish_text(open, None).await?;
        }
        for (_, part) in reasoning.drain() {
            self.finish_reasoning(part, None).await?;
        }
        Ok(())
    }

    fn new_part(&self, data: PartData) -> Part {
        Part {
            id: ascending(IdPrefix::Part),
            session_id: self.assistant.session_id.clone(),
            message_id: self.assistant.id.clone(),
            data,
        }
    }

    fn new_text_part(&self, metadata: Option<Value>) -> Part {
        self.new_part(PartData::Text {
            text: String::new(),
            synthetic: false,
            ignored: false,
            time: Some(PartTime {
                start: chrono::Utc::now().timestamp_millis(),
                end: None,
            }),
            metadata,
        })
    }

    async fn write_part(&self, data: PartData) -> StewardResult<Part> {
        let part = self.new_part(data);
        self.runtime.sessions.update_part(&part, None).await?;
        Ok(part)
    }

    async fn persist_message(&self) -> StewardResult<()> {
        self.runtime
            .sessions
            .update_message(MessageInfo::Assistant(self.assistant.clone()))
            .await?;
        Ok(())
    }

    async fn finish_text(&self, mut part: Part, end_metadata: Option<Value>) -> StewardResult<()> {
        let hook_input = TextCompleteInput {
            session_id: self.assistant.session_id.clone(),
            message_id: self.assistant.id.clone(),
            part_id: part.id.clone(),
        };
        if let PartData::Text {
            text,
            time,
            metadata,
            ..
        } = &mut part.data
        {
            let mut completed = text.trim_end().to_string();
            self.runtime
                .hooks
                .text_complete(&hook_input, &mut completed)
                .await?;
            *text = completed;
            let now = chrono::Utc::now().timestamp_millis();
            let start = time.map(|t| t.start).unwrap_or(now);
            *time = Some(PartTime {
                start,
                end: Some(now),
            });
            if end_metadata.is_some() {
                *metadata = end_metadata;
            }
        }
        self.runtime.sessions.update_part(&part, None).await
    }

    async fn finish_reasoning(&self, mut part: Part, end_metadata: Option<Value>) -> StewardResult<()> {
        if let PartData::Reasoning {
            text,
            time,
            metadata,
        } = &mut part.data
        {
            *text = text.trim_end().to_string();
            time.end = Some(chrono::Utc::now().timestamp_millis());
            if end_metadata.is_some() {
                *metadata = end_metadata;
            }
        }
        self.runtime.sessions.update_part(&part, None).await
    }

    async fn handle_tool_call(
        &mut self,
        call_id: String,
        tool_name: String,
        args: Value,
        provider_executed: bool,
        input: &StreamInput,
    ) -> StewardResult<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let mut part = match self.tool_parts.remove(&call_id) {
            Some(part) => part,
            None => self.new_part(PartData::Tool {
                call_id: call_id.clone(),
                tool: tool_name.clone(),
                state: ToolState::pending(),
                metadata: None,
            }),
        };
        if let PartData::Tool { tool, state, .. } = &mut part.data {
            *tool = tool_name.clone();
            *state = state.start(args.clone(), now)?;
        }
        self.runtime.sessions.update_part(&part, None).await?;

        if provider_executed {
            self.tool_parts.insert(call_id, part);
            return Ok(());
        }

        let result = match self.check_doom_loop(&part, &tool_name, &args, input).await {
            Ok(()) => self.execute_tool(&part, &tool_name, args, input).await,
            Err(err) => Err(err),
        };

        match result {
            Ok(completion) => {
                self.settle_tool(part, Ok(completion)).await?;
            }
            Err(err) if err.is_cancelled() => {
                // Cleanup marks the part aborted.
                self.tool_parts.insert(call_id, part);
                return Err(err);
            }
            Err(err) => {
                if matches!(err, StewardError::PermissionRejected(_)) {
                    self.blocked = !self.runtime.config.experimental.continue_loop_on_deny;
                }
                warn!(
                    "Tool call failed: session_id={}, tool={}, call_id={}, error={}",
                    self.assistant.session_id, tool_name, call_id, err
                );
                let message = match &err {
                    StewardError::PermissionRejected(rejected) => rejected.message.clone(),
                    StewardError::Tool(message) => message.clone(),
                    other => other.to_string(),
                };
                self.settle_tool(part, Err(message)).await?;
            }
        }
        Ok(())
    }

    async fn settle_tool(&self, mut part: Part, result: Result<ToolCompletion, String>) -> StewardResult<()> {
        let now = chrono::Utc::now().timestamp_millis();
        if let PartData::Tool { state, .. } = &mut part.data {
            *state = match result {
                Ok(completion) => state.complete(completion, now)?,
                Err(message) => state.fail(message, now)?,
            };
        }
        self.runtime.sessions.update_part(&part, None).await
    }

    async fn handle_provider_tool_result(
        &mut self,
        call_id: &str,
        result: Result<ProviderToolOutput, String>,
    ) -> StewardResult<()> {
        let running = self
            .tool_parts
            .get(call_id)
            .and_then(|p| p.tool_state())
            .is_some_and(|s| matches!(s, ToolState::Running { .. }));
        if !running {
            return Ok(());
        }
        let Some(part) = self.tool_parts.remove(call_id) else {
            return Ok(());
        };
        let result = result.map(|output| ToolCompletion {
            title: output.title,
            output: output.output,
            metadata: output.metadata,
            attachments: Vec::new(),
        });
        self.settle_tool(part, result).await
    }

    /// Asks before a call that repeats the previous identical calls of this turn.
    async fn check_doom_loop(
        &self,
        part: &Part,
        tool_name: &str,
        args: &Value,
        input: &StreamInput,
    ) -> StewardResult<()> {
        let history = self
            .runtime
            .sessions
            .messages(&self.assistant.session_id)
            .await?;
        let previous: Vec<&Part> = history
            .iter()
            .filter(|m| {
                m.info
                    .as_assistant()
                    .is_some_and(|a| a.parent_id == input.user.id)
            })
            .flat_map(|m| m.parts.iter())
            .filter(|p| {
                p.id != part.id
                    && p.tool_state()
                        .is_some_and(|s| !matches!(s, ToolState::Pending { .. }))
            })
            .collect();
        if previous.len() < DOOM_LOOP_THRESHOLD {
            return Ok(());
        }

        let serialized = args.to_string();
        let repeated = previous[previous.len() - DOOM_LOOP_THRESHOLD..]
            .iter()
            .all(|p| match &p.data {
                PartData::Tool { tool, state, .. } => {
                    tool == tool_name && state.input().to_string() == serialized
                }
                _ => false,
            });
        if !repeated {
            return Ok(());
        }

        warn!(
            "Doom loop detected: session_id={}, tool={}",
            self.assistant.session_id, tool_name
        );
        let call_id = match &part.data {
            PartData::Tool { call_id, .. } => Some(call_id.clone()),
            _ => None,
        };
        self.runtime
            .permission
            .ask(
                AskInput {
                    permission_type: "doom_loop".to_string(),
                    pattern: Some(vec![tool_name.to_string()]),
                    session_id: self.assistant.session_id.clone(),
                    message_id: self.assistant.id.clone(),
                    call_id,
                    message: format!(
                        "{} was called {} times in a row with the same input",
                        tool_name, DOOM_LOOP_THRESHOLD
                    ),
                    metadata: json!({ "tool": tool_name, "input": args }),
                },
                &input.cancel,
            )
            .await
    }

    async fn execute_tool(
        &self,
        part: &Part,
        tool_name: &str,
        mut args: Value,
        input: &StreamInput,
    ) -> StewardResult<ToolCompletion> {
        let tool = input
            .tools
            .iter()
            .find(|t| t.name() == tool_name)
            .cloned()
            .ok_or_else(|| {
                StewardError::tool(format!("Model tried to call unavailable tool '{}'", tool_name))
            })?;
        let call_id = match &part.data {
            PartData::Tool { call_id, .. } => call_id.clone(),
            _ => String::new(),
        };

        let hook_input = ToolHookInput {
            tool: tool_name.to_string(),
            session_id: self.assistant.session_id.clone(),
            call_id: call_id.clone(),
        };
        self.runtime
            .hooks
            .tool_execute_before(&hook_input, &mut args)
            .await?;

        let ctx = ToolContext::new(
            self.assistant.session_id.clone(),
            self.assistant.id.clone(),
            part.id.clone(),
            call_id,
            input.agent.name.clone(),
            input.cancel.clone(),
            self.runtime.permission.clone(),
            self.runtime.sessions.clone(),
        );
        debug!(
            "Executing tool: session_id={}, tool={}, part_id={}",
            self.assistant.session_id, tool_name, part.id
        );
        let mut completion = tokio::select! {
            _ = input.cancel.cancelled() => {
                return Err(StewardError::cancelled(format!("Tool {} aborted", tool_name)));
            }
            result = tool.execute(args, ctx) => result?,
        };

        self.runtime
            .hooks
            .tool_execute_after(&hook_input, &mut completion)
            .await?;
        Ok(completion)
    }

    async fn emit_patch(&mut self) -> StewardResult<()> {
        let Some(hash) = self.snapshot.take() else {
            return Ok(());
        };
        let patch = self.runtime.snapshot.patch(&hash).await?;
        if !patch.files.is_empty() {
            self.write_part(PartData::Patch {
                hash: patch.hash,
                files: patch.files,
            })
            .await?;
        }
        Ok(())
    }

    /// Runs on every exit: no tool part may stay pending or running.
    async fn cleanup(&mut self) -> StewardResult<()> {
        self.emit_patch().await?;
        let now = chrono::Utc::now().timestamp_millis();
        for mut part in self.runtime.sessions.parts(&self.assistant.id).await? {
            let PartData::Tool { state, .. } = &mut part.data else {
                continue;
            };
            if state.is_terminal() {
                continue;
            }
            let running = match state {
                ToolState::Pending { .. } => state.start(state.input().clone(), now)?,
                _ => state.clone(),
            };
            *state = running.fail(TOOL_ABORTED, now)?;
            self.runtime.sessions.update_part(&part, None).await?;
        }
        self.tool_parts.clear();

        self.assistant.time.completed = Some(now);
        self.persist_message().await?;
        info!(
            "Stream processing finished: session_id={}, message_id={}, finish={:?}, error={}",
            self.assistant.session_id,
            self.assistant.id,
            self.assistant.finish,
            self.assistant.error.is_some()
        );
        Ok(())
    }
}

/// Appends `delta` to a text or reasoning part. Returns whether there is
/// anything worth persisting.
fn append_text(part: &mut Part, delta: &str, new_metadata: Option<Value>) -> bool {
    match &mut part.data {
        PartData::Text { text, metadata, .. } | PartData::Reasoning { text, metadata, .. } => {
            text.push_str(delta);
            if new_metadata.is_some() {
                *metadata = new_metadata;
            }
            !text.is_empty()
        }
        _ => false,
    }
}
