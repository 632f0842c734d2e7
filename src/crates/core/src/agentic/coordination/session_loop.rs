//! Session turn loop
//!
//! At most one loop runs per session. Callers arriving while a loop is in
//! flight wait for its result instead of starting another one.

use super::title::spawn_ensure_title;
use crate::agentic::agents::{AgentInfo, BUILD_AGENT};
use crate::agentic::core::{filter_compacted, new_assistant, to_model_messages};
use crate::agentic::execution::{ProcessOutcome, StreamInput, StreamProcessor};
use crate::agentic::hooks::{ChatParamsInput, ToolHookInput};
use crate::agentic::runtime::AgentRuntime;
use crate::agentic::session::{compaction, summary};
use crate::agentic::tools::ToolContext;
use crate::infrastructure::ai::{ChatParams, ModelInfo, ModelMessage};
use crate::util::errors::{StewardError, StewardResult};
use crate::util::identifier::{ascending, IdPrefix};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use log::{debug, info, warn};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use steward_core_types::{
    AssistantMessage, MessageInfo, MessageTime, MessageWithParts, ModelRef, Part, PartData,
    PartTime, Session, SessionStatus, ToolCompletion, ToolState, UserMessage,
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

pub const TASK_TOOL: &str = "task";
pub const SUBTASK_FOLLOW_UP: &str =
    "Summarize the task tool output above and continue with your task.";
pub const MAX_STEPS_PROMPT: &str = "CRITICAL - MAXIMUM STEPS REACHED\n\nThe maximum number of steps allowed for this task has been reached. Tools are disabled until next user input. Respond with text only.";

pub type LoopResult = StewardResult<MessageWithParts>;

/// One piece of user input for [`SessionCoordinator::prompt`].
#[derive(Debug, Clone, PartialEq)]
pub enum PromptPart {
    Text {
        text: String,
        synthetic: bool,
    },
    File {
        mime: String,
        filename: Option<String>,
        url: String,
    },
    Agent {
        name: String,
    },
    Subtask {
        prompt: String,
        description: String,
        agent: String,
        command: Option<String>,
    },
}

impl PromptPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            synthetic: false,
        }
    }

    fn into_data(self) -> PartData {
        match self {
            Self::Text { text, synthetic } => PartData::Text {
                text,
                synthetic,
                ignored: false,
                time: None,
                metadata: None,
            },
            Self::File {
                mime,
                filename,
                url,
            } => PartData::File {
                mime,
                filename,
                url,
            },
            Self::Agent { name } => PartData::Agent { name },
            Self::Subtask {
                prompt,
                description,
                agent,
                command,
            } => PartData::Subtask {
                prompt,
                description,
                agent,
                command,
            },
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct PromptInput {
    pub session_id: String,
    /// Falls back to the agent's model, then to the last model used in the session
    pub model: Option<ModelRef>,
    /// Defaults to `build`
    pub agent: Option<String>,
    /// Persist the message without running the loop
    pub no_reply: bool,
    pub tools: BTreeMap<String, bool>,
    pub system: Option<String>,
    pub parts: Vec<PromptPart>,
}

struct LoopEntry {
    run_id: u64,
    cancel: CancellationToken,
    waiters: Vec<oneshot::Sender<LoopResult>>,
}

/// Pending work found in history newer than the latest finished reply.
enum PendingTask {
    Compaction {
        auto: bool,
    },
    Subtask {
        prompt: String,
        description: String,
        agent: String,
        command: Option<String>,
    },
}

struct HistoryScan {
    last_user: Option<UserMessage>,
    last_assistant: Option<AssistantMessage>,
    last_finished: Option<AssistantMessage>,
    /// Newest first; the oldest pending task is at the end
    tasks: Vec<PendingTask>,
}

fn scan_history(history: &[MessageWithParts]) -> HistoryScan {
    let mut scan = HistoryScan {
        last_user: None,
        last_assistant: None,
        last_finished: None,
        tasks: Vec::new(),
    };
    for message in history.iter().rev() {
        match &message.info {
            MessageInfo::User(user) => {
                if scan.last_user.is_none() {
                    scan.last_user = Some(user.clone());
                }
            }
            MessageInfo::Assistant(assistant) => {
                if scan.last_assistant.is_none() {
                    scan.last_assistant = Some(assistant.clone());
                }
                if scan.last_finished.is_none() && assistant.finish.is_some() {
                    scan.last_finished = Some(assistant.clone());
                }
            }
        }
        if scan.last_user.is_some() && scan.last_finished.is_some() {
            break;
        }
        if scan.last_finished.is_none() {
            for part in &message.parts {
                match &part.data {
                    PartData::Compaction { auto } => {
                        scan.tasks.push(PendingTask::Compaction { auto: *auto })
                    }
                    PartData::Subtask {
                        prompt,
                        description,
                        agent,
                        command,
                    } => scan.tasks.push(PendingTask::Subtask {
                        prompt: prompt.clone(),
                        description: description.clone(),
                        agent: agent.clone(),
                        command: command.clone(),
                    }),
                    _ => {}
                }
            }
        }
    }
    scan
}

/// Wraps user text queued after `after_id` so the model treats it as an
/// interjection.
fn wrap_queued_messages(history: &mut [MessageWithParts], after_id: &str) {
    for message in history
        .iter_mut()
        .filter(|m| m.info.is_user() && m.info.id() > after_id)
    {
        for part in &mut message.parts {
            if let PartData::Text {
                text,
                synthetic: false,
                ignored: false,
                ..
            } = &mut part.data
            {
                if text.trim().is_empty() {
                    continue;
                }
                *text = format!(
                    "<system-reminder>\nThe user sent the following message:\n{}\n\nPlease address this message and continue with your tasks.\n</system-reminder>",
                    text
                );
            }
        }
    }
}

pub struct SessionCoordinator {
    runtime: AgentRuntime,
    loops: DashMap<String, LoopEntry>,
    next_run_id: AtomicU64,
}

/// Releases the loop slot when the driving future ends or is dropped.
struct LoopGuard<'a> {
    coordinator: &'a SessionCoordinator,
    session_id: String,
    run_id: u64,
}

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        self.coordinator
            .release(&self.session_id, self.run_id, None);
    }
}

impl SessionCoordinator {
    pub fn new(runtime: AgentRuntime) -> Self {
        Self {
            runtime,
            loops: DashMap::new(),
            next_run_id: AtomicU64::new(1),
        }
    }

    pub fn runtime(&self) -> &AgentRuntime {
        &self.runtime
    }

    pub fn is_busy(&self, session_id: &str) -> bool {
        self.loops.contains_key(session_id)
    }

    pub fn assert_not_busy(&self, session_id: &str) -> StewardResult<()> {
        if self.is_busy(session_id) {
            return Err(StewardError::SessionBusy(session_id.to_string()));
        }
        Ok(())
    }

    /// Persists a user message and, unless `no_reply`, runs the loop.
    pub async fn prompt(&self, input: PromptInput) -> LoopResult {
        let runtime = &self.runtime;
        let session = runtime.sessions.get(&input.session_id).await?;
        self.cleanup_revert(&session).await?;

        let agent_name = input.agent.unwrap_or_else(|| BUILD_AGENT.to_string());
        let agent = runtime.agents.get(&agent_name)?;
        let model = match input.model.or(agent.model) {
            Some(model) => model,
            None => self
                .last_model(&session.id)
                .await?
                .ok_or_else(|| StewardError::validation("No model specified for prompt"))?,
        };

        let user = UserMessage {
            id: ascending(IdPrefix::Message),
            session_id: session.id.clone(),
            time: MessageTime::created_at(chrono::Utc::now().timestamp_millis()),
            agent: agent_name,
            model,
            tools: input.tools,
            system: input.system,
            summary: None,
        };
        runtime
            .sessions
            .update_message(MessageInfo::User(user.clone()))
            .await?;
        let mut parts = Vec::with_capacity(input.parts.len());
        for prompt_part in input.parts {
            let part = Part {
                id: ascending(IdPrefix::Part),
                session_id: session.id.clone(),
                message_id: user.id.clone(),
                data: prompt_part.into_data(),
            };
            runtime.sessions.update_part(&part, None).await?;
            parts.push(part);
        }
        runtime.sessions.touch(&session.id).await?;
        info!(
            "User message received: session_id={}, message_id={}, parts={}",
            session.id,
            user.id,
            parts.len()
        );

        if input.no_reply {
            return Ok(MessageWithParts {
                info: MessageInfo::User(user),
                parts,
            });
        }
        self.run_loop(&session.id).await
    }

    /// Runs the turn loop, or joins the one already running for the session.
    pub async fn run_loop(&self, session_id: &str) -> LoopResult {
        let slot = match self.loops.entry(session_id.to_string()) {
            Entry::Occupied(mut entry) => {
                let (tx, rx) = oneshot::channel();
                entry.get_mut().waiters.push(tx);
                Err(rx)
            }
            Entry::Vacant(entry) => {
                let run_id = self.next_run_id.fetch_add(1, Ordering::Relaxed);
                let cancel = CancellationToken::new();
                entry.insert(LoopEntry {
                    run_id,
                    cancel: cancel.clone(),
                    waiters: Vec::new(),
                });
                Ok((run_id, cancel))
            }
        };
        let (run_id, cancel) = match slot {
            Ok(owned) => owned,
            Err(rx) => {
                debug!("Session loop joined: session_id={}", session_id);
                return rx
                    .await
                    .unwrap_or_else(|_| Err(StewardError::cancelled("Session loop ended")));
            }
        };

        let _guard = LoopGuard {
            coordinator: self,
            session_id: session_id.to_string(),
            run_id,
        };
        info!("Session loop started: session_id={}", session_id);
        let result = self.drive(session_id, &cancel).await;
        match &result {
            Ok(message) => info!(
                "Session loop finished: session_id={}, message_id={}",
                session_id,
                message.info.id()
            ),
            Err(e) => warn!(
                "Session loop failed: session_id={}, error={}",
                session_id, e
            ),
        }
        self.release(session_id, run_id, Some(&result));
        if cancel.is_cancelled() && !self.is_busy(session_id) {
            self.runtime.status.set(session_id, SessionStatus::Idle);
        }
        result
    }

    /// Frees the slot of run `run_id`. Waiters get `result`, or a cancellation
    /// error when there is none.
    fn release(&self, session_id: &str, run_id: u64, result: Option<&LoopResult>) {
        let Some((_, entry)) = self
            .loops
            .remove_if(session_id, |_, entry| entry.run_id == run_id)
        else {
            return;
        };
        for waiter in entry.waiters {
            let outcome = match result {
                Some(result) => result.clone(),
                None => Err(StewardError::cancelled("Session loop cancelled")),
            };
            let _ = waiter.send(outcome);
        }
        self.runtime.status.set(session_id, SessionStatus::Idle);
    }

    /// Aborts the running loop. Waiters are rejected and the session goes idle.
    pub fn cancel(&self, session_id: &str) {
        if let Some((_, entry)) = self.loops.remove(session_id) {
            info!("Session loop cancelled: session_id={}", session_id);
            entry.cancel.cancel();
            for waiter in entry.waiters {
                let _ = waiter.send(Err(StewardError::cancelled("Session loop cancelled")));
            }
        }
        self.runtime.status.set(session_id, SessionStatus::Idle);
    }

    /// Cancels loops and pending permissions of the session and its children,
    /// then removes them from storage.
    pub async fn remove_session(&self, session_id: &str) -> StewardResult<()> {
        let mut stack = vec![session_id.to_string()];
        while let Some(id) = stack.pop() {
            stack.extend(
                self.runtime
                    .sessions
                    .children(&id)
                    .await?
                    .into_iter()
                    .map(|s| s.id),
            );
            if self.is_busy(&id) {
                self.cancel(&id);
            }
            self.runtime.permission.dispose_session(&id);
        }
        self.runtime.sessions.remove(session_id).await
    }

    /// Cancels every loop and rejects every pending permission request.
    pub fn dispose(&self) {
        let sessions: Vec<String> = self.loops.iter().map(|e| e.key().clone()).collect();
        for session_id in sessions {
            self.cancel(&session_id);
        }
        self.runtime.permission.dispose_all();
    }

    async fn last_model(&self, session_id: &str) -> StewardResult<Option<ModelRef>> {
        Ok(self
            .runtime
            .sessions
            .messages(session_id)
            .await?
            .iter()
            .rev()
            .find_map(|m| m.info.as_user().map(|u| u.model.clone())))
    }

    /// Drops history past the session's revert marker before new input.
    async fn cleanup_revert(&self, session: &Session) -> StewardResult<()> {
        let Some(revert) = session.revert.clone() else {
            return Ok(());
        };
        let sessions = &self.runtime.sessions;
        for message in sessions.messages(&session.id).await? {
            let id = message.info.id();
            if id < revert.message_id.as_str() {
                continue;
            }
            match &revert.part_id {
                Some(part_id) if id == revert.message_id => {
                    for part in message.parts.iter().filter(|p| &p.id >= part_id) {
                        sessions.remove_part(&session.id, id, &part.id).await?;
                    }
                }
                _ => sessions.remove_message(&session.id, id).await?,
            }
        }
        sessions.update(&session.id, |s| s.revert = None).await?;
        info!(
            "Revert applied: session_id={}, message_id={}",
            session.id, revert.message_id
        );
        Ok(())
    }

    async fn drive(&self, session_id: &str, cancel: &CancellationToken) -> LoopResult {
        let runtime = &self.runtime;
        let session = runtime.sessions.get(session_id).await?;
        let mut step: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            runtime.status.set(session_id, SessionStatus::Busy);

            let history = filter_compacted(runtime.sessions.messages(session_id).await?);
            let mut scan = scan_history(&history);
            let Some(last_user) = scan.last_user.clone() else {
                return Err(StewardError::validation(format!(
                    "No user message in session {}",
                    session_id
                )));
            };
            if let Some(last) = &scan.last_assistant {
                if last.finished_terminally() && last_user.id < last.id {
                    debug!("Session loop done: session_id={}, step={}", session_id, step);
                    break;
                }
            }

            step += 1;
            debug!("Session loop step: session_id={}, step={}", session_id, step);
            if step == 1 {
                spawn_ensure_title(
                    runtime.clone(),
                    session.clone(),
                    history.clone(),
                    last_user.model.clone(),
                );
            }

            let model = runtime
                .provider
                .model(&last_user.model.provider_id, &last_user.model.model_id)
                .await?;

            match scan.tasks.pop() {
                Some(PendingTask::Subtask {
                    prompt,
                    description,
                    agent,
                    command,
                }) => {
                    let args = json!({
                        "prompt": prompt,
                        "description": description,
                        "subagent_type": agent,
                        "command": command,
                    });
                    self.run_subtask(&session, &last_user, &agent, args, &model, cancel)
                        .await?;
                    continue;
                }
                Some(PendingTask::Compaction { auto }) => {
                    let outcome = compaction::process(
                        runtime, session_id, &last_user, &history, auto, cancel,
                    )
                    .await?;
                    if outcome == ProcessOutcome::Stop {
                        break;
                    }
                    continue;
                }
                None => {}
            }

            if let Some(finished) = &scan.last_finished {
                if !finished.summary
                    && compaction::is_overflow(&finished.tokens, &model, &runtime.config)
                {
                    compaction::create(
                        runtime,
                        session_id,
                        &last_user.agent,
                        last_user.model.clone(),
                        true,
                    )
                    .await?;
                    continue;
                }
            }

            let agent = runtime.agents.get(&last_user.agent)?;
            let outcome = self
                .run_step(step, &last_user, scan.last_finished.as_ref(), history, agent, model, cancel)
                .await?;
            match outcome {
                ProcessOutcome::Stop => break,
                ProcessOutcome::Compact => {
                    compaction::create(
                        runtime,
                        session_id,
                        &last_user.agent,
                        last_user.model.clone(),
                        true,
                    )
                    .await?;
                }
                ProcessOutcome::Continue => {}
            }
        }

        let prune_runtime = runtime.clone();
        let prune_session = session_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = compaction::prune(&prune_runtime, &prune_session).await {
                warn!("Prune failed: session_id={}, error={}", prune_session, e);
            }
        });

        runtime
            .sessions
            .messages(session_id)
            .await?
            .into_iter()
            .rev()
            .find(|m| !m.info.is_user())
            .ok_or_else(|| {
                StewardError::not_found(format!("No assistant reply in session {}", session_id))
            })
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_step(
        &self,
        step: u32,
        last_user: &UserMessage,
        last_finished: Option<&AssistantMessage>,
        mut history: Vec<MessageWithParts>,
        agent: AgentInfo,
        model: ModelInfo,
        cancel: &CancellationToken,
    ) -> StewardResult<ProcessOutcome> {
        let runtime = &self.runtime;
        let session = runtime.sessions.get(&last_user.session_id).await?;
        let is_last_step = agent.max_steps.is_some_and(|max| step >= max);
        let tools = if is_last_step {
            Vec::new()
        } else {
            runtime.tools.resolve(&last_user.tools, &session.permission)
        };

        let assistant = new_assistant(
            ascending(IdPrefix::Message),
            &session,
            &last_user.id,
            &agent.name,
            &model,
        );
        runtime
            .sessions
            .update_message(MessageInfo::Assistant(assistant.clone()))
            .await?;

        if step == 1 {
            summary::spawn_summarize(runtime.clone(), session.id.clone(), last_user.id.clone());
        }
        if step > 1 {
            if let Some(finished) = last_finished {
                wrap_queued_messages(&mut history, &finished.id);
            }
        }

        let mut messages = to_model_messages(&history);
        if is_last_step {
            info!(
                "Maximum steps reached: session_id={}, agent={}, step={}",
                session.id, agent.name, step
            );
            messages.push(ModelMessage::assistant_text(MAX_STEPS_PROMPT));
        }

        let mut params = ChatParams {
            temperature: agent.temperature,
            top_p: agent.top_p,
            ..Default::default()
        };
        runtime
            .hooks
            .chat_params(
                &ChatParamsInput {
                    session_id: session.id.clone(),
                    agent: agent.name.clone(),
                    model: model.clone(),
                },
                &mut params,
            )
            .await?;

        let system: Vec<String> = agent
            .prompt
            .iter()
            .chain(last_user.system.iter())
            .cloned()
            .collect();

        let mut processor = StreamProcessor::new(runtime.clone(), assistant, model);
        processor
            .process(&StreamInput {
                user: last_user.clone(),
                agent,
                system,
                messages,
                tools,
                params,
                cancel: cancel.clone(),
            })
            .await
    }

    /// Runs a user-requested subtask through the `task` tool, outside the model.
    async fn run_subtask(
        &self,
        session: &Session,
        last_user: &UserMessage,
        agent: &str,
        mut args: serde_json::Value,
        model: &ModelInfo,
        cancel: &CancellationToken,
    ) -> StewardResult<()> {
        let runtime = &self.runtime;
        let now = chrono::Utc::now().timestamp_millis();
        let mut assistant = new_assistant(
            ascending(IdPrefix::Message),
            session,
            &last_user.id,
            agent,
            model,
        );
        runtime
            .sessions
            .update_message(MessageInfo::Assistant(assistant.clone()))
            .await?;

        let call_id = ascending(IdPrefix::Part);
        let part = Part {
            id: ascending(IdPrefix::Part),
            session_id: session.id.clone(),
            message_id: assistant.id.clone(),
            data: PartData::Tool {
                call_id: call_id.clone(),
                tool: TASK_TOOL.to_string(),
                state: ToolState::pending().start(args.clone(), now)?,
                metadata: None,
            },
        };
        runtime.sessions.update_part(&part, None).await?;
        info!(
            "Subtask started: session_id={}, agent={}, part_id={}",
            session.id, agent, part.id
        );

        let hook_input = ToolHookInput {
            tool: TASK_TOOL.to_string(),
            session_id: session.id.clone(),
            call_id: part.id.clone(),
        };
        let before = runtime
            .hooks
            .tool_execute_before(&hook_input, &mut args)
            .await;

        let mut result: StewardResult<ToolCompletion> = match (before, runtime.tools.get(TASK_TOOL)) {
            (Err(e), _) => Err(e),
            (Ok(()), None) => Err(StewardError::tool("task tool is not registered")),
            (Ok(()), Some(tool)) => {
                let ctx = ToolContext::new(
                    session.id.clone(),
                    assistant.id.clone(),
                    part.id.clone(),
                    call_id,
                    agent,
                    cancel.clone(),
                    runtime.permission.clone(),
                    runtime.sessions.clone(),
                );
                tokio::select! {
                    _ = cancel.cancelled() => Err(StewardError::cancelled("Subtask aborted")),
                    result = tool.execute(args, ctx) => result,
                }
            }
        };
        let after = match &mut result {
            Ok(completion) => runtime.hooks.tool_execute_after(&hook_input, completion).await,
            Err(_) => Ok(()),
        };
        if let Err(e) = after {
            result = Err(e);
        }

        let end = chrono::Utc::now().timestamp_millis();
        assistant.finish = Some("tool-calls".to_string());
        assistant.time.completed = Some(end);
        runtime
            .sessions
            .update_message(MessageInfo::Assistant(assistant.clone()))
            .await?;

        // The tool may have published progress on the part meanwhile.
        let mut part = match runtime.sessions.get_part(&assistant.id, &part.id).await {
            Ok(current) => current,
            Err(e) if e.is_not_found() => part,
            Err(e) => return Err(e),
        };
        if let PartData::Tool { state, .. } = &mut part.data {
            if !state.is_terminal() {
                *state = match result {
                    Ok(completion) => state.complete(completion, end)?,
                    Err(e) => {
                        warn!(
                            "Subtask execution failed: session_id={}, agent={}, error={}",
                            session.id, agent, e
                        );
                        state.fail(format!("Tool execution failed: {}", e), end)?
                    }
                };
            }
        }
        runtime.sessions.update_part(&part, None).await?;

        let follow_up = UserMessage {
            id: ascending(IdPrefix::Message),
            session_id: session.id.clone(),
            time: MessageTime::created_at(end),
            agent: last_user.agent.clone(),
            model: last_user.model.clone(),
            tools: Default::default(),
            system: None,
            summary: None,
        };
        runtime
            .sessions
            .update_message(MessageInfo::User(follow_up.clone()))
            .await?;
        runtime
            .sessions
            .update_part(
                &Part {
                    id: ascending(IdPrefix::Part),
                    session_id: session.id.clone(),
                    message_id: follow_up.id,
                    data: PartData::Text {
                        text: SUBTASK_FOLLOW_UP.to_string(),
                        synthetic: true,
                        ignored: false,
                        time: Some(PartTime {
                            start: end,
                            end: Some(end),
                        }),
                        metadata: None,
                    },
                },
                None,
            )
            .await
    }
}
