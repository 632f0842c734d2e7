//! Context compaction
//!
//! Overflow detection, pruning of stale tool outputs, and the summarizing
//! turn that replaces older history.

use crate::agentic::agents::COMPACTION_AGENT;
use crate::agentic::core::{new_assistant, to_model_messages};
use crate::agentic::events::CoreEvent;
use crate::agentic::execution::{ProcessOutcome, StreamInput, StreamProcessor};
use crate::agentic::runtime::AgentRuntime;
use crate::infrastructure::ai::{ChatParams, ModelInfo, ModelMessage};
use crate::service::config::CoreConfig;
use crate::util::errors::StewardResult;
use crate::util::identifier::{ascending, IdPrefix};
use crate::util::token;
use log::{debug, info};
use steward_core_types::{
    MessageInfo, MessageTime, MessageWithParts, ModelRef, Part, PartData, PartTime, TokenUsage,
    ToolState, UserMessage,
};
use tokio_util::sync::CancellationToken;

/// Pruning only happens when it frees more than this many tokens
pub const PRUNE_MINIMUM: u64 = 20_000;
/// Most recent tool output kept intact
pub const PRUNE_PROTECT: u64 = 40_000;
const PRUNE_PROTECTED_TOOLS: &[&str] = &["skill"];

pub const SUMMARY_PROMPT: &str = "Provide a detailed prompt for continuing our conversation above. Focus on information that would be helpful for continuing the conversation, including what we did, what we're doing, which files we're working on, and what we're going to do next considering new session will not have access to our conversation.";
pub const CONTINUE_PROMPT: &str = "Continue if you have next steps";

/// Whether the last step left too little room for another response.
pub fn is_overflow(tokens: &TokenUsage, model: &ModelInfo, config: &CoreConfig) -> bool {
    if !config.compaction.auto {
        return false;
    }
    let context = model.limit.context;
    if context == 0 {
        return false;
    }
    let cap = config.experimental.output_token_max;
    let reserved = match model.limit.output.min(cap) {
        0 => cap,
        output => output,
    };
    let count = tokens
        .input
        .saturating_add(tokens.cache.read)
        .saturating_add(tokens.output);
    count > context.saturating_sub(reserved)
}

/// Marks old tool outputs as compacted. Returns how many parts were pruned.
///
/// The two most recent turns are never touched. Walking further back, the
/// newest `PRUNE_PROTECT` tokens of output stay, and the rest is cleared only
/// when it adds up to more than `PRUNE_MINIMUM`.
pub async fn prune(runtime: &AgentRuntime, session_id: &str) -> StewardResult<usize> {
    if !runtime.config.compaction.prune {
        return Ok(0);
    }
    let messages = runtime.sessions.messages(session_id).await?;
    let candidates = select_prunable(&messages);
    if candidates.is_empty() {
        return Ok(0);
    }

    let now = chrono::Utc::now().timestamp_millis();
    let mut count = 0;
    for mut part in candidates {
        if let PartData::Tool {
            state: ToolState::Completed { time, .. },
            ..
        } = &mut part.data
        {
            time.compacted = Some(now);
            runtime.sessions.update_part(&part, None).await?;
            count += 1;
        }
    }
    info!("Session pruned: session_id={}, parts={}", session_id, count);
    Ok(count)
}

fn select_prunable(messages: &[MessageWithParts]) -> Vec<Part> {
    let mut total = 0u64;
    let mut pruned = 0u64;
    let mut candidates = Vec::new();
    let mut turns = 0;

    'messages: for message in messages.iter().rev() {
        if message.info.is_user() {
            turns += 1;
        }
        if turns < 2 {
            continue;
        }
        if message
            .info
            .as_assistant()
            .is_some_and(|a| a.summary && a.finish.is_some())
        {
            break;
        }
        for part in message.parts.iter().rev() {
            let PartData::Tool { tool, state, .. } = &part.data else {
                continue;
            };
            let ToolState::Completed { output, time, .. } = state else {
                continue;
            };
            if PRUNE_PROTECTED_TOOLS.contains(&tool.as_str()) {
                continue;
            }
            if time.compacted.is_some() {
                break 'messages;
            }
            let estimate = token::estimate(output);
            total += estimate;
            if total > PRUNE_PROTECT {
                pruned += estimate;
                candidates.push(part.clone());
            }
        }
    }

    debug!("Prune scan: total={}, prunable={}", total, pruned);
    if pruned > PRUNE_MINIMUM {
        candidates
    } else {
        Vec::new()
    }
}

/// Queues a compaction: a user message whose only part is a compaction marker.
pub async fn create(
    runtime: &AgentRuntime,
    session_id: &str,
    agent: &str,
    model: ModelRef,
    auto: bool,
) -> StewardResult<UserMessage> {
    let user = UserMessage {
        id: ascending(IdPrefix::Message),
        session_id: session_id.to_string(),
        time: MessageTime::created_at(chrono::Utc::now().timestamp_millis()),
        agent: agent.to_string(),
        model,
        tools: Default::default(),
        system: None,
        summary: None,
    };
    runtime
        .sessions
        .update_message(MessageInfo::User(user.clone()))
        .await?;
    runtime
        .sessions
        .update_part(
            &Part {
                id: ascending(IdPrefix::Part),
                session_id: session_id.to_string(),
                message_id: user.id.clone(),
                data: PartData::Compaction { auto },
            },
            None,
        )
        .await?;
    info!(
        "Compaction requested: session_id={}, auto={}",
        session_id, auto
    );
    Ok(user)
}

/// Runs the summarizing turn for the compaction requested by `parent`.
pub async fn process(
    runtime: &AgentRuntime,
    session_id: &str,
    parent: &UserMessage,
    history: &[MessageWithParts],
    auto: bool,
    cancel: &CancellationToken,
) -> StewardResult<ProcessOutcome> {
    let agent = runtime.agents.get(COMPACTION_AGENT)?;
    let model_ref = agent.model.clone().unwrap_or_else(|| parent.model.clone());
    let model = runtime
        .provider
        .model(&model_ref.provider_id, &model_ref.model_id)
        .await?;
    let session = runtime.sessions.get(session_id).await?;

    let mut assistant = new_assistant(
        ascending(IdPrefix::Message),
        &session,
        &parent.id,
        COMPACTION_AGENT,
        &model,
    );
    assistant.summary = true;
    runtime
        .sessions
        .update_message(MessageInfo::Assistant(assistant.clone()))
        .await?;
    info!(
        "Compaction started: session_id={}, message_id={}",
        session_id, assistant.id
    );

    let compacting = runtime.hooks.session_compacting(session_id).await?;
    let prompt = compacting.prompt.unwrap_or_else(|| {
        std::iter::once(SUMMARY_PROMPT.to_string())
            .chain(compacting.context)
            .collect::<Vec<_>>()
            .join("\n\n")
    });
    let mut messages = to_model_messages(history);
    messages.push(ModelMessage::user_text(prompt));

    let mut processor = StreamProcessor::new(runtime.clone(), assistant, model);
    let outcome = processor
        .process(&StreamInput {
            user: parent.clone(),
            agent: agent.clone(),
            system: Vec::new(),
            messages,
            tools: Vec::new(),
            params: ChatParams {
                temperature: agent.temperature,
                top_p: agent.top_p,
                ..Default::default()
            },
            cancel: cancel.clone(),
        })
        .await?;

    if outcome == ProcessOutcome::Continue && auto {
        let now = chrono::Utc::now().timestamp_millis();
        let user = UserMessage {
            id: ascending(IdPrefix::Message),
            session_id: session_id.to_string(),
            time: MessageTime::created_at(now),
            agent: parent.agent.clone(),
            model: parent.model.clone(),
            tools: Default::default(),
            system: None,
            summary: None,
        };
        runtime
            .sessions
            .update_message(MessageInfo::User(user.clone()))
            .await?;
        runtime
            .sessions
            .update_part(
                &Part {
                    id: ascending(IdPrefix::Part),
                    session_id: session_id.to_string(),
                    message_id: user.id,
                    data: PartData::Text {
                        text: CONTINUE_PROMPT.to_string(),
                        synthetic: true,
                        ignored: false,
                        time: Some(PartTime {
                            start: now,
                            end: Some(now),
                        }),
                        metadata: None,
                    },
                },
                None,
            )
            .await?;
    }

    if processor.message().error.is_some() {
        return Ok(ProcessOutcome::Stop);
    }
    runtime.events.publish(CoreEvent::SessionCompacted {
        session_id: session_id.to_string(),
    });
    info!("Session compacted: session_id={}", session_id);
    Ok(ProcessOutcome::Continue)
}
