//! Conversions between persisted history and provider messages

use crate::infrastructure::ai::{ModelContent, ModelInfo, ModelMessage, ModelRole};
use std::collections::HashSet;
use steward_core_types::{
    AssistantMessage, MessageInfo, MessagePath, MessageTime, MessageWithParts, PartData, Session,
    TokenUsage, ToolState,
};

pub const COMPACTED_OUTPUT_PLACEHOLDER: &str = "[Old tool result content cleared]";
pub const INTERRUPTED_TOOL_PLACEHOLDER: &str = "[Tool execution was interrupted]";
const COMPACTION_QUESTION: &str = "What did we do so far?";
const SUBTASK_NOTICE: &str = "The following tool was executed by the user";

/// Drops everything older than the latest finished compaction.
///
/// `messages` is oldest first. The walk runs newest to oldest and stops at the
/// user message carrying the compaction part whose summary already finished.
pub fn filter_compacted(messages: Vec<MessageWithParts>) -> Vec<MessageWithParts> {
    let mut completed: HashSet<String> = HashSet::new();
    let mut result = Vec::new();
    for message in messages.into_iter().rev() {
        let boundary = message.info.is_user()
            && completed.contains(message.info.id())
            && message
                .parts
                .iter()
                .any(|p| matches!(p.data, PartData::Compaction { .. }));
        if let MessageInfo::Assistant(assistant) = &message.info {
            if assistant.summary && assistant.finish.is_some() {
                completed.insert(assistant.parent_id.clone());
            }
        }
        result.push(message);
        if boundary {
            break;
        }
    }
    result.reverse();
    result
}

/// Builds the provider conversation from history.
///
/// Errored assistant messages are skipped unless they were aborted after
/// producing content. Tool results follow their assistant message as a
/// `tool` role message.
pub fn to_model_messages(messages: &[MessageWithParts]) -> Vec<ModelMessage> {
    let mut result = Vec::new();
    for message in messages {
        if message.parts.is_empty() {
            continue;
        }
        match &message.info {
            MessageInfo::User(_) => {
                let content = user_content(message);
                if !content.is_empty() {
                    result.push(ModelMessage {
                        role: ModelRole::User,
                        content,
                    });
                }
            }
            MessageInfo::Assistant(info) => {
                if let Some(error) = &info.error {
                    let has_content = message.parts.iter().any(|p| {
                        !matches!(
                            p.data,
                            PartData::StepStart { .. } | PartData::Reasoning { .. }
                        )
                    });
                    if !(error.is_aborted() && has_content) {
                        continue;
                    }
                }
                push_assistant(message, &mut result);
            }
        }
    }
    result
}

fn user_content(message: &MessageWithParts) -> Vec<ModelContent> {
    let mut content = Vec::new();
    for part in &message.parts {
        match &part.data {
            PartData::Text { text, ignored, .. } if !ignored => {
                content.push(ModelContent::Text { text: text.clone() })
            }
            PartData::File {
                mime,
                filename,
                url,
            } if mime != "text/plain" && mime != "application/x-directory" => {
                content.push(ModelContent::File {
                    mime: mime.clone(),
                    url: url.clone(),
                    filename: filename.clone(),
                })
            }
            PartData::Compaction { .. } => content.push(ModelContent::Text {
                text: COMPACTION_QUESTION.to_string(),
            }),
            PartData::Subtask { .. } => content.push(ModelContent::Text {
                text: SUBTASK_NOTICE.to_string(),
            }),
            _ => {}
        }
    }
    content
}

fn push_assistant(message: &MessageWithParts, result: &mut Vec<ModelMessage>) {
    let mut content = Vec::new();
    let mut results = Vec::new();
    let mut attachments = Vec::new();

    for part in &message.parts {
        match &part.data {
            PartData::Text { text, .. } => content.push(ModelContent::Text { text: text.clone() }),
            PartData::Reasoning { text, .. } => {
                content.push(ModelContent::Reasoning { text: text.clone() })
            }
            PartData::Tool {
                call_id,
                tool,
                state,
                ..
            } => {
                let (output, is_error) = match state {
                    ToolState::Completed {
                        output,
                        time,
                        attachments: files,
                        ..
                    } => {
                        if !files.is_empty() {
                            attachments.push((tool.clone(), files.clone()));
                        }
                        if time.compacted.is_some() {
                            (COMPACTED_OUTPUT_PLACEHOLDER.to_string(), false)
                        } else {
                            (output.clone(), false)
                        }
                    }
                    ToolState::Error { error, .. } => (error.clone(), true),
                    ToolState::Pending { .. } | ToolState::Running { .. } => {
                        (INTERRUPTED_TOOL_PLACEHOLDER.to_string(), true)
                    }
                };
                content.push(ModelContent::ToolCall {
                    call_id: call_id.clone(),
                    tool: tool.clone(),
                    input: state.input().clone(),
                });
                results.push(ModelContent::ToolResult {
                    call_id: call_id.clone(),
                    tool: tool.clone(),
                    output,
                    is_error,
                });
            }
            _ => {}
        }
    }

    if content.is_empty() {
        return;
    }
    result.push(ModelMessage {
        role: ModelRole::Assistant,
        content,
    });
    if !results.is_empty() {
        result.push(ModelMessage {
            role: ModelRole::Tool,
            content: results,
        });
    }
    for (tool, files) in attachments {
        let mut content = vec![ModelContent::Text {
            text: format!("Tool {} returned an attachment:", tool),
        }];
        content.extend(files.into_iter().map(|f| ModelContent::File {
            mime: f.mime,
            url: f.url,
            filename: f.filename,
        }));
        result.push(ModelMessage {
            role: ModelRole::User,
            content,
        });
    }
}

/// Fresh assistant message for `model`, replying to `parent_id`.
pub fn new_assistant(
    id: String,
    session: &Session,
    parent_id: &str,
    agent: &str,
    model: &ModelInfo,
) -> AssistantMessage {
    AssistantMessage {
        id,
        session_id: session.id.clone(),
        parent_id: parent_id.to_string(),
        time: MessageTime::created_at(chrono::Utc::now().timestamp_millis()),
        agent: agent.to_string(),
        mode: agent.to_string(),
        provider_id: model.provider_id.clone(),
        model_id: model.id.clone(),
        path: MessagePath {
            cwd: session.directory.clone(),
            root: session.directory.clone(),
        },
        cost: 0.0,
        tokens: TokenUsage::default(),
        error: None,
        finish: None,
        summary: false,
    }
}
