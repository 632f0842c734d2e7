use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionTime {
    pub created: i64,
}

/// An outstanding approval request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    pub id: String,
    /// What is being asked for, e.g. `bash` or `doom_loop`
    #[serde(rename = "type")]
    pub permission_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<Vec<String>>,
    pub session_id: String,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub call_id: Option<String>,
    /// Human readable title
    pub message: String,
    #[serde(default)]
    pub metadata: Value,
    pub time: PermissionTime,
}

impl PermissionRequest {
    /// Keys matched against approved patterns: the explicit patterns, or the type.
    pub fn keys(&self) -> Vec<String> {
        match &self.pattern {
            Some(patterns) if !patterns.is_empty() => patterns.clone(),
            _ => vec![self.permission_type.clone()],
        }
    }
}

/// Caller-provided part of a request.
#[derive(Debug, Clone, PartialEq)]
pub struct AskInput {
    pub permission_type: String,
    pub pattern: Option<Vec<String>>,
    pub session_id: String,
    pub message_id: String,
    pub call_id: Option<String>,
    pub message: String,
    pub metadata: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionResponse {
    Once,
    Always,
    Reject,
}

/// Verdict of the `permission.ask` hook.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionDecision {
    #[default]
    Ask,
    Allow,
    Deny,
}
