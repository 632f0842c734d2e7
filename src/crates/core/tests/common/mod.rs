#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use steward_core::agentic::hooks::ToolHookInput;
use steward_core::agentic::session::CreateSessionInput;
use steward_core::infrastructure::ai::{
    EventStream, ModelCost, ModelLimit, ProviderUsage,
};
use steward_core::infrastructure::snapshot::{SnapshotPatch, SnapshotProvider};
use steward_core::{
    AgentRuntime, AgentRuntimeBuilder, CoreConfig, ModelInfo, ModelProvider, Plugin, PromptInput, PromptPart,
    ProviderError,
    SessionCoordinator, StewardResult, StreamEvent, StreamRequest, Tool, ToolContext,
};
use steward_core_types::{MessageWithParts, ModelRef, Part, PartData, Session, ToolCompletion};
use tokio_util::sync::CancellationToken;

pub const PROVIDER: &str = "scripted";
pub const MODEL: &str = "main";
pub const SMALL_MODEL: &str = "small";
pub const GENERATED_TITLE: &str = "Scripted title";

/// One scripted answer of the provider.
pub enum Reply {
    Events(Vec<StreamEvent>),
    /// Waits before the stream opens
    Delayed(Duration, Vec<StreamEvent>),
    /// Emits the events, then never ends
    Hang(Vec<StreamEvent>),
    Fail(ProviderError),
}

/// Provider that answers main-model calls from a queue. Calls to the small
/// model always produce [`GENERATED_TITLE`].
#[derive(Default)]
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<StreamRequest>>,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Main-model requests received so far.
    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn model_info(id: &str) -> ModelInfo {
        ModelInfo {
            id: id.to_string(),
            provider_id: PROVIDER.to_string(),
            name: id.to_string(),
            limit: ModelLimit {
                context: 200_000,
                output: 32_000,
            },
            cost: ModelCost::default(),
        }
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn model(&self, provider_id: &str, model_id: &str) -> Result<ModelInfo, ProviderError> {
        if provider_id != PROVIDER {
            return Err(ProviderError::other(format!("unknown provider {}", provider_id)));
        }
        Ok(Self::model_info(model_id))
    }

    async fn small_model(&self, _provider_id: &str) -> Result<Option<ModelInfo>, ProviderError> {
        Ok(Some(Self::model_info(SMALL_MODEL)))
    }

    async fn stream(
        &self,
        request: StreamRequest,
        _cancel: CancellationToken,
    ) -> Result<EventStream, ProviderError> {
        if request.model.id == SMALL_MODEL {
            return Ok(futures::stream::iter(text_reply(GENERATED_TITLE)).boxed());
        }
        self.requests.lock().unwrap().push(request);
        let reply = self.replies.lock().unwrap().pop_front();
        match reply {
            Some(Reply::Events(events)) => Ok(futures::stream::iter(events).boxed()),
            Some(Reply::Delayed(delay, events)) => {
                tokio::time::sleep(delay).await;
                Ok(futures::stream::iter(events).boxed())
            }
            Some(Reply::Hang(events)) => Ok(futures::stream::iter(events)
                .chain(futures::stream::pending::<StreamEvent>())
                .boxed()),
            Some(Reply::Fail(err)) => Err(err),
            None => Err(ProviderError::other("no scripted reply left")),
        }
    }
}

pub fn usage(input: u64, output: u64) -> ProviderUsage {
    ProviderUsage {
        input_tokens: input,
        output_tokens: output,
        ..Default::default()
    }
}

pub fn text_reply(text: &str) -> Vec<StreamEvent> {
    text_reply_with_usage(text, usage(120, 12))
}

pub fn text_reply_with_usage(text: &str, usage: ProviderUsage) -> Vec<StreamEvent> {
    vec![
        StreamEvent::Start,
        StreamEvent::StartStep,
        StreamEvent::TextStart { metadata: None },
        StreamEvent::text(text),
        StreamEvent::TextEnd { metadata: None },
        StreamEvent::finish_step("stop", usage),
        StreamEvent::Finish {
            finish_reason: Some("stop".to_string()),
        },
    ]
}

pub fn tool_reply(call_id: &str, tool: &str, input: Value) -> Vec<StreamEvent> {
    tool_reply_with_usage(call_id, tool, input, usage(150, 20))
}

pub fn tool_reply_with_usage(
    call_id: &str,
    tool: &str,
    input: Value,
    usage: ProviderUsage,
) -> Vec<StreamEvent> {
    vec![
        StreamEvent::Start,
        StreamEvent::StartStep,
        StreamEvent::tool_call(call_id, tool, input),
        StreamEvent::finish_step("tool-calls", usage),
        StreamEvent::Finish {
            finish_reason: Some("tool-calls".to_string()),
        },
    ]
}

/// Returns its `text` argument; counts executions.
#[derive(Default)]
pub struct EchoTool {
    pub runs: AtomicUsize,
}

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> String {
        "Echo the given text".to_string()
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }

    async fn execute(&self, args: Value, _ctx: ToolContext) -> StewardResult<ToolCompletion> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        let text = args["text"].as_str().unwrap_or_default().to_string();
        Ok(ToolCompletion {
            title: "echo".to_string(),
            output: text,
            metadata: json!({}),
            attachments: Vec::new(),
        })
    }
}

/// Asks for `bash` permission before doing anything.
pub struct GuardedTool;

#[async_trait]
impl Tool for GuardedTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> String {
        "Run a shell command".to_string()
    }

    fn parameters(&self) -> Value {
        json!({ "type": "object", "properties": { "command": { "type": "string" } } })
    }

    async fn execute(&self, args: Value, ctx: ToolContext) -> StewardResult<ToolCompletion> {
        let command = args["command"].as_str().unwrap_or_default().to_string();
        ctx.ask("bash", Some(vec![command.clone()]), format!("Run {}", command), args.clone())
            .await?;
        Ok(ToolCompletion {
            title: command,
            output: "ran".to_string(),
            metadata: json!({}),
            attachments: Vec::new(),
        })
    }
}

/// Stand-in for the sub-agent tool; records the arguments it was given.
#[derive(Default)]
pub struct TaskTool {
    pub calls: Mutex<Vec<Value>>,
}

#[async_trait]
impl Tool for TaskTool {
    fn name(&self) -> &str {
        "task"
    }

    fn description(&self) -> String {
        "Run a sub-agent".to_string()
    }

    fn parameters(&self) -> Value {
        json!({ "type": "object" })
    }

    async fn execute(&self, args: Value, _ctx: ToolContext) -> StewardResult<ToolCompletion> {
        self.calls.lock().unwrap().push(args);
        Ok(ToolCompletion {
            title: "explore".to_string(),
            output: "sub-agent found three files".to_string(),
            metadata: json!({}),
            attachments: Vec::new(),
        })
    }
}

/// Reports `files` as changed for every checkpoint.
pub struct FixedSnapshot {
    pub files: Vec<String>,
}

#[async_trait]
impl SnapshotProvider for FixedSnapshot {
    async fn track(&self) -> StewardResult<Option<String>> {
        Ok(Some("snap_1".to_string()))
    }

    async fn patch(&self, hash: &str) -> StewardResult<SnapshotPatch> {
        Ok(SnapshotPatch {
            hash: hash.to_string(),
            files: self.files.clone(),
        })
    }
}

/// Reports one new file per checkpoint: `src/file_1.rs`, `src/file_2.rs`, ...
#[derive(Default)]
pub struct SequencedSnapshot {
    patches: AtomicUsize,
}

#[async_trait]
impl SnapshotProvider for SequencedSnapshot {
    async fn track(&self) -> StewardResult<Option<String>> {
        Ok(Some("snap".to_string()))
    }

    async fn patch(&self, hash: &str) -> StewardResult<SnapshotPatch> {
        let n = self.patches.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SnapshotPatch {
            hash: hash.to_string(),
            files: vec![format!("src/file_{}.rs", n)],
        })
    }
}

/// Refuses every tool call before it runs.
pub struct VetoPlugin;

#[async_trait]
impl Plugin for VetoPlugin {
    fn name(&self) -> &str {
        "veto"
    }

    async fn tool_execute_before(
        &self,
        input: &ToolHookInput,
        _args: &mut Value,
    ) -> anyhow::Result<()> {
        anyhow::bail!("{} is not allowed here", input.tool)
    }
}

pub struct Harness {
    pub provider: Arc<ScriptedProvider>,
    pub coordinator: Arc<SessionCoordinator>,
    pub session: Session,
}

impl Harness {
    pub async fn new(replies: Vec<Reply>, tools: Vec<Arc<dyn Tool>>) -> Self {
        Self::with_config(replies, tools, CoreConfig::default()).await
    }

    pub async fn with_config(
        replies: Vec<Reply>,
        tools: Vec<Arc<dyn Tool>>,
        config: CoreConfig,
    ) -> Self {
        Self::build(replies, move |mut builder| {
            for tool in tools {
                builder = builder.tool(tool);
            }
            builder.config(config)
        })
        .await
    }

    pub async fn build<F>(replies: Vec<Reply>, configure: F) -> Self
    where
        F: FnOnce(AgentRuntimeBuilder) -> AgentRuntimeBuilder,
    {
        let provider = ScriptedProvider::new(replies);
        let runtime = configure(AgentRuntime::builder(provider.clone())).build();
        let session = runtime
            .sessions
            .create(CreateSessionInput {
                project_id: "project".to_string(),
                directory: "/work".to_string(),
                ..Default::default()
            })
            .await
            .expect("create session");
        Self {
            provider,
            coordinator: Arc::new(SessionCoordinator::new(runtime)),
            session,
        }
    }

    pub fn runtime(&self) -> &AgentRuntime {
        self.coordinator.runtime()
    }

    pub fn input(&self, parts: Vec<PromptPart>) -> PromptInput {
        PromptInput {
            session_id: self.session.id.clone(),
            model: Some(ModelRef::new(PROVIDER, MODEL)),
            parts,
            ..Default::default()
        }
    }

    pub async fn say(&self, text: &str) -> StewardResult<MessageWithParts> {
        self.coordinator
            .prompt(self.input(vec![PromptPart::text(text)]))
            .await
    }

    pub async fn messages(&self) -> Vec<MessageWithParts> {
        self.runtime()
            .sessions
            .messages(&self.session.id)
            .await
            .expect("messages")
    }
}

pub fn texts(parts: &[Part]) -> Vec<String> {
    parts
        .iter()
        .filter_map(|p| match &p.data {
            PartData::Text { text, .. } => Some(text.clone()),
            _ => None,
        })
        .collect()
}

/// Polls `check` until it holds or a second has passed.
pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
