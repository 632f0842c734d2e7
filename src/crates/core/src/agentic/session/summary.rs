//! Turn summary
//!
//! Records which files a user turn changed, derived from the patch parts of
//! the assistant replies to it. Runs off the hot path.

use crate::agentic::runtime::AgentRuntime;
use crate::util::errors::StewardResult;
use log::{debug, warn};
use std::collections::BTreeSet;
use steward_core_types::{FileDiff, MessageInfo, PartData, UserSummary};

/// Changed files for `user_message_id`, stored on the user message.
///
/// Runs for one user message at a time, so every pass recomputes from the
/// parts stored when it starts and no pass can overwrite a newer one.
pub async fn summarize_turn(
    runtime: &AgentRuntime,
    session_id: &str,
    user_message_id: &str,
) -> StewardResult<()> {
    let _turn = runtime
        .turn_locks
        .write(&format!("summary/{}", user_message_id))
        .await;

    let messages = runtime.sessions.messages(session_id).await?;
    let Some(user) = messages
        .iter()
        .find(|m| m.info.id() == user_message_id)
        .and_then(|m| m.info.as_user())
    else {
        return Ok(());
    };

    let files: BTreeSet<String> = messages
        .iter()
        .filter(|m| {
            m.info
                .as_assistant()
                .is_some_and(|a| a.parent_id == user_message_id)
        })
        .flat_map(|m| m.parts.iter())
        .filter_map(|p| match &p.data {
            PartData::Patch { files, .. } => Some(files.iter().cloned()),
            _ => None,
        })
        .flatten()
        .collect();

    let previous = user.summary.clone();
    let known = previous.as_ref().map(|s| s.diffs.as_slice()).unwrap_or_default();
    let diffs: Vec<FileDiff> = files
        .into_iter()
        .map(|file| {
            known
                .iter()
                .find(|d| d.file == file)
                .cloned()
                .unwrap_or(FileDiff {
                    file,
                    additions: 0,
                    deletions: 0,
                })
        })
        .collect();
    if previous.as_ref().is_some_and(|s| s.diffs == diffs) {
        return Ok(());
    }

    debug!(
        "Turn summarized: session_id={}, message_id={}, files={}",
        session_id,
        user_message_id,
        diffs.len()
    );
    runtime
        .sessions
        .update_message_with(session_id, user_message_id, move |info| {
            if let MessageInfo::User(user) = info {
                let summary = user.summary.take().unwrap_or_default();
                user.summary = Some(UserSummary { diffs, ..summary });
            }
        })
        .await?;
    Ok(())
}

/// Fire-and-forget variant; failures are only logged.
pub fn spawn_summarize(runtime: AgentRuntime, session_id: String, user_message_id: String) {
    tokio::spawn(async move {
        if let Err(e) = summarize_turn(&runtime, &session_id, &user_message_id).await {
            warn!(
                "Turn summary failed: session_id={}, message_id={}, error={}",
                session_id, user_message_id, e
            );
        }
    });
}
