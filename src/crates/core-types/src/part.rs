use crate::message::{MessageError, TokenUsage};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartTime {
    pub start: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolTime {
    pub start: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
    /// Set once pruning replaced the output with a placeholder
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compacted: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileAttachment {
    pub mime: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    pub url: String,
}

/// Result of a finished tool execution.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCompletion {
    pub title: String,
    pub output: String,
    pub metadata: Value,
    pub attachments: Vec<FileAttachment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolStateError {
    #[error("Invalid tool state transition: {from} -> {to}")]
    InvalidTransition {
        from: &'static str,
        to: &'static str,
    },
}

/// Lifecycle of one tool call: `pending -> running -> completed | error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum ToolState {
    Pending {
        input: Value,
        #[serde(default)]
        raw: String,
    },
    Running {
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
        time: ToolTime,
    },
    Completed {
        input: Value,
        output: String,
        title: String,
        #[serde(default)]
        metadata: Value,
        time: ToolTime,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<FileAttachment>,
    },
    Error {
        input: Value,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
        time: ToolTime,
    },
}

impl ToolState {
    pub fn pending() -> Self {
        Self::Pending {
            input: Value::Object(Default::default()),
            raw: String::new(),
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            Self::Pending { .. } => "pending",
            Self::Running { .. } => "running",
            Self::Completed { .. } => "completed",
            Self::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Error { .. })
    }

    pub fn input(&self) -> &Value {
        match self {
            Self::Pending { input, .. }
            | Self::Running { input, .. }
            | Self::Completed { input, .. }
            | Self::Error { input, .. } => input,
        }
    }

    /// `pending -> running`
    pub fn start(&self, input: Value, now: i64) -> Result<Self, ToolStateError> {
        match self {
            Self::Pending { .. } => Ok(Self::Running {
                input,
                title: None,
                metadata: None,
                time: ToolTime {
                    start: now,
                    end: None,
                    compacted: None,
                },
            }),
            other => Err(ToolStateError::InvalidTransition {
                from: other.status(),
                to: "running",
            }),
        }
    }

    /// `running -> completed`
    pub fn complete(&self, completion: ToolCompletion, now: i64) -> Result<Self, ToolStateError> {
        match self {
            Self::Running { input, time, .. } => Ok(Self::Completed {
                input: input.clone(),
                output: completion.output,
                title: completion.title,
                metadata: completion.metadata,
                time: ToolTime {
                    start: time.start,
                    end: Some(now),
                    compacted: None,
                },
                attachments: completion.attachments,
            }),
            other => Err(ToolStateError::InvalidTransition {
                from: other.status(),
                to: "completed",
            }),
        }
    }

    /// `running -> error`
    pub fn fail(&self, error: impl Into<String>, now: i64) -> Result<Self, ToolStateError> {
        match self {
            Self::Running {
                input,
                metadata,
                time,
                ..
            } => Ok(Self::Error {
                input: input.clone(),
                error: error.into(),
                metadata: metadata.clone(),
                time: ToolTime {
                    start: time.start,
                    end: Some(now),
                    compacted: None,
                },
            }),
            other => Err(ToolStateError::InvalidTransition {
                from: other.status(),
                to: "error",
            }),
        }
    }

    pub fn is_compacted(&self) -> bool {
        matches!(self, Self::Completed { time, .. } if time.compacted.is_some())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum PartData {
    Text {
        text: String,
        #[serde(default)]
        synthetic: bool,
        #[serde(default)]
        ignored: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        time: Option<PartTime>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    Reasoning {
        text: String,
        time: PartTime,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    Tool {
        call_id: String,
        tool: String,
        state: ToolState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<Value>,
    },
    File {
        mime: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
        url: String,
    },
    StepStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        snapshot: Option<String>,
    },
    StepFinish {
        reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        snapshot: Option<String>,
        cost: f64,
        tokens: TokenUsage,
    },
    Patch {
        hash: String,
        files: Vec<String>,
    },
    Agent {
        name: String,
    },
    Subtask {
        prompt: String,
        description: String,
        agent: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<String>,
    },
    Compaction {
        auto: bool,
    },
    Retry {
        attempt: u32,
        error: MessageError,
        created: i64,
    },
}

impl PartData {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Reasoning { .. } => "reasoning",
            Self::Tool { .. } => "tool",
            Self::File { .. } => "file",
            Self::StepStart { .. } => "step-start",
            Self::StepFinish { .. } => "step-finish",
            Self::Patch { .. } => "patch",
            Self::Agent { .. } => "agent",
            Self::Subtask { .. } => "subtask",
            Self::Compaction { .. } => "compaction",
            Self::Retry { .. } => "retry",
        }
    }

    pub fn synthetic_text(text: impl Into<String>) -> Self {
        Self::Text {
            text: text.into(),
            synthetic: true,
            ignored: false,
            time: None,
            metadata: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    pub id: String,
    pub session_id: String,
    pub message_id: String,
    #[serde(flatten)]
    pub data: PartData,
}

impl Part {
    pub fn tool_state(&self) -> Option<&ToolState> {
        match &self.data {
            PartData::Tool { state, .. } => Some(state),
            _ => None,
        }
    }

    pub fn is_synthetic_text(&self) -> bool {
        matches!(self.data, PartData::Text { synthetic: true, .. })
    }
}
