//! Session title generation
//!
//! After the first real user message, a small model names the session. Best
//! effort: failures are logged and the default title stays.

use crate::agentic::agents::TITLE_AGENT;
use crate::agentic::core::to_model_messages;
use crate::agentic::runtime::AgentRuntime;
use crate::agentic::session::is_default_title;
use crate::infrastructure::ai::{ChatParams, ModelInfo, ModelMessage, StreamEvent, StreamRequest};
use crate::util::errors::{StewardError, StewardResult};
use futures::StreamExt;
use log::{debug, warn};
use regex::Regex;
use std::sync::OnceLock;
use steward_core_types::{MessageWithParts, ModelRef, PartData, Session};
use tokio_util::sync::CancellationToken;

const TITLE_REQUEST: &str = "Generate a title for this conversation:\n";
const MAX_TITLE_CHARS: usize = 100;

fn is_real_user(message: &MessageWithParts) -> bool {
    message.info.is_user() && !message.parts.iter().all(|p| p.is_synthetic_text())
}

/// First non-empty line of `raw` without `<think>` blocks, shortened to 100 chars.
pub fn clean_title(raw: &str) -> Option<String> {
    static THINK: OnceLock<Option<Regex>> = OnceLock::new();
    let stripped = match THINK
        .get_or_init(|| Regex::new(r"(?s)<think>.*?</think>\s*").ok())
        .as_ref()
    {
        Some(re) => re.replace_all(raw, "").into_owned(),
        None => raw.to_string(),
    };
    let line = stripped
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())?;
    if line.chars().count() > MAX_TITLE_CHARS {
        let head: String = line.chars().take(MAX_TITLE_CHARS - 3).collect();
        Some(format!("{}...", head))
    } else {
        Some(line.to_string())
    }
}

/// Generates and stores a title when `session` still has its default one and
/// `history` holds exactly one real user message.
pub async fn ensure_title(
    runtime: &AgentRuntime,
    session: &Session,
    history: &[MessageWithParts],
    model: &ModelRef,
) -> StewardResult<()> {
    if session.parent_id.is_some() || !is_default_title(&session.title) {
        return Ok(());
    }
    let Some(first_index) = history.iter().position(is_real_user) else {
        return Ok(());
    };
    if history.iter().filter(|m| is_real_user(m)).count() != 1 {
        return Ok(());
    }

    let context = &history[..=first_index];
    let first = &history[first_index];
    let subtask_prompts: Vec<&str> = first
        .parts
        .iter()
        .filter_map(|p| match &p.data {
            PartData::Subtask { prompt, .. } => Some(prompt.as_str()),
            _ => None,
        })
        .collect();
    let only_subtasks = !subtask_prompts.is_empty() && subtask_prompts.len() == first.parts.len();

    let agent = runtime.agents.get(TITLE_AGENT)?;
    let title_model = resolve_model(runtime, agent.model.as_ref(), model).await?;

    let mut messages = vec![ModelMessage::user_text(TITLE_REQUEST)];
    if only_subtasks {
        messages.push(ModelMessage::user_text(subtask_prompts.join("\n")));
    } else {
        messages.extend(to_model_messages(context));
    }

    let request = StreamRequest {
        session_id: session.id.clone(),
        model: title_model,
        system: agent.prompt.iter().cloned().collect(),
        messages,
        tools: Vec::new(),
        params: ChatParams {
            temperature: agent.temperature,
            top_p: agent.top_p,
            ..Default::default()
        },
    };
    let mut stream = runtime
        .provider
        .stream(request, CancellationToken::new())
        .await?;
    let mut text = String::new();
    while let Some(event) = stream.next().await {
        match event {
            StreamEvent::TextDelta { text: delta, .. } => text.push_str(&delta),
            StreamEvent::Error(err) => return Err(StewardError::Provider(err)),
            _ => {}
        }
    }

    let Some(title) = clean_title(&text) else {
        return Ok(());
    };
    debug!("Session titled: session_id={}, title={}", session.id, title);
    runtime
        .sessions
        .update(&session.id, move |s| s.title = title)
        .await?;
    Ok(())
}

async fn resolve_model(
    runtime: &AgentRuntime,
    agent_model: Option<&ModelRef>,
    fallback: &ModelRef,
) -> StewardResult<ModelInfo> {
    if let Some(model) = agent_model {
        return Ok(runtime
            .provider
            .model(&model.provider_id, &model.model_id)
            .await?);
    }
    if let Some(small) = runtime.provider.small_model(&fallback.provider_id).await? {
        return Ok(small);
    }
    Ok(runtime
        .provider
        .model(&fallback.provider_id, &fallback.model_id)
        .await?)
}

pub fn spawn_ensure_title(
    runtime: AgentRuntime,
    session: Session,
    history: Vec<MessageWithParts>,
    model: ModelRef,
) {
    tokio::spawn(async move {
        if let Err(e) = ensure_title(&runtime, &session, &history, &model).await {
            warn!(
                "Failed to generate title: session_id={}, error={}",
                session.id, e
            );
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_think_blocks_and_blank_lines() {
        let raw = "<think>\nlet me see\n</think>\n\n  Fix login redirect  \nsecond line";
        assert_eq!(clean_title(raw).as_deref(), Some("Fix login redirect"));
    }

    #[test]
    fn long_titles_are_truncated() {
        let title = clean_title(&"a".repeat(150)).unwrap();
        assert_eq!(title.chars().count(), 100);
        assert!(title.ends_with("..."));
        assert_eq!(clean_title(&"b".repeat(100)).unwrap().len(), 100);
    }

    #[test]
    fn empty_output_yields_nothing() {
        assert_eq!(clean_title("<think>only thoughts</think>\n   \n"), None);
    }
}
