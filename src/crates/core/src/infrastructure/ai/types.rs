//! Provider-neutral request and stream types

use super::error::ProviderError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelLimit {
    /// Context window in tokens; 0 means unknown
    pub context: u64,
    /// Maximum output tokens; 0 means unknown
    pub output: u64,
}

/// Prices in USD per million tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostRates {
    pub input: f64,
    pub output: f64,
    #[serde(default)]
    pub cache_read: f64,
    #[serde(default)]
    pub cache_write: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelCost {
    #[serde(flatten)]
    pub base: CostRates,
    /// Tier applied once input + cached input exceeds 200K tokens
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub over_200k: Option<CostRates>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelInfo {
    pub id: String,
    pub provider_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub limit: ModelLimit,
    #[serde(default)]
    pub cost: ModelCost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ModelContent {
    Text {
        text: String,
    },
    Reasoning {
        text: String,
    },
    File {
        mime: String,
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
    ToolCall {
        call_id: String,
        tool: String,
        input: Value,
    },
    ToolResult {
        call_id: String,
        tool: String,
        output: String,
        #[serde(default)]
        is_error: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelMessage {
    pub role: ModelRole,
    pub content: Vec<ModelContent>,
}

impl ModelMessage {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: ModelRole::User,
            content: vec![ModelContent::Text { text: text.into() }],
        }
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: ModelRole::Assistant,
            content: vec![ModelContent::Text { text: text.into() }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Sampling parameters, adjustable by the `chat.params` hook.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub options: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamRequest {
    pub session_id: String,
    pub model: ModelInfo,
    pub system: Vec<String>,
    pub messages: Vec<ModelMessage>,
    pub tools: Vec<ToolDefinition>,
    pub params: ChatParams,
}

/// Token counts as reported by the provider for one step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub reasoning_tokens: u64,
    #[serde(default)]
    pub cached_input_tokens: u64,
}

/// Output of a tool the provider executed on its own side.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderToolOutput {
    pub title: String,
    pub output: String,
    pub metadata: Value,
}

/// One event of an inference stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Start,
    ReasoningStart {
        id: String,
        metadata: Option<Value>,
    },
    ReasoningDelta {
        id: String,
        text: String,
        metadata: Option<Value>,
    },
    ReasoningEnd {
        id: String,
        metadata: Option<Value>,
    },
    TextStart {
        metadata: Option<Value>,
    },
    TextDelta {
        text: String,
        metadata: Option<Value>,
    },
    TextEnd {
        metadata: Option<Value>,
    },
    ToolInputStart {
        id: String,
        tool_name: String,
    },
    ToolInputDelta {
        id: String,
        delta: String,
    },
    ToolInputEnd {
        id: String,
    },
    ToolCall {
        call_id: String,
        tool_name: String,
        input: Value,
        /// The provider runs the tool itself and reports `ToolResult`/`ToolError`
        provider_executed: bool,
    },
    ToolResult {
        call_id: String,
        output: ProviderToolOutput,
    },
    ToolError {
        call_id: String,
        error: String,
    },
    StartStep,
    FinishStep {
        finish_reason: String,
        usage: ProviderUsage,
        provider_metadata: Option<Value>,
    },
    Finish {
        finish_reason: Option<String>,
    },
    Error(ProviderError),
}

impl StreamEvent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::TextDelta {
            text: text.into(),
            metadata: None,
        }
    }

    pub fn tool_call(call_id: impl Into<String>, tool_name: impl Into<String>, input: Value) -> Self {
        Self::ToolCall {
            call_id: call_id.into(),
            tool_name: tool_name.into(),
            input,
            provider_executed: false,
        }
    }

    pub fn finish_step(finish_reason: impl Into<String>, usage: ProviderUsage) -> Self {
        Self::FinishStep {
            finish_reason: finish_reason.into(),
            usage,
            provider_metadata: None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::ReasoningStart { .. } => "reasoning-start",
            Self::ReasoningDelta { .. } => "reasoning-delta",
            Self::ReasoningEnd { .. } => "reasoning-end",
            Self::TextStart { .. } => "text-start",
            Self::TextDelta { .. } => "text-delta",
            Self::TextEnd { .. } => "text-end",
            Self::ToolInputStart { .. } => "tool-input-start",
            Self::ToolInputDelta { .. } => "tool-input-delta",
            Self::ToolInputEnd { .. } => "tool-input-end",
            Self::ToolCall { .. } => "tool-call",
            Self::ToolResult { .. } => "tool-result",
            Self::ToolError { .. } => "tool-error",
            Self::StartStep => "start-step",
            Self::FinishStep { .. } => "finish-step",
            Self::Finish { .. } => "finish",
            Self::Error(_) => "error",
        }
    }
}
