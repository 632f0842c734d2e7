mod common;

use common::*;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use steward_core::agentic::coordination::session_loop::MAX_STEPS_PROMPT;
use steward_core::infrastructure::ai::{ModelContent, ModelRole};
use steward_core::service::config::AgentConfig;
use steward_core::{
    CoreConfig, PermissionResponse, PromptPart, ProviderError, StewardError, StreamEvent,
    DEFAULT_REJECTION_MESSAGE,
};
use steward_core_types::{
    MessageError, MessageInfo, MessageWithParts, PartData, SessionRevert, SessionStatus, ToolState,
};

fn assistant_finish(message: &MessageWithParts) -> Option<String> {
    message.info.as_assistant().and_then(|a| a.finish.clone())
}

#[tokio::test]
async fn text_reply_finishes_the_turn() {
    let harness = Harness::new(vec![Reply::Events(text_reply("Hello! How can I help?"))], vec![]).await;

    let reply = harness.say("Hi").await.expect("loop result");

    assert_eq!(assistant_finish(&reply).as_deref(), Some("stop"));
    assert_eq!(texts(&reply.parts), vec!["Hello! How can I help?".to_string()]);
    assert_eq!(harness.provider.calls(), 1);
    assert_eq!(
        harness.runtime().status.get(&harness.session.id),
        SessionStatus::Idle
    );

    let messages = harness.messages().await;
    assert_eq!(messages.len(), 2);
    assert!(messages[0].info.is_user());
    let assistant = messages[1].info.as_assistant().expect("assistant");
    assert_eq!(assistant.parent_id, messages[0].info.id());
    assert_eq!(assistant.tokens.input, 120);
    assert!(assistant.time.completed.is_some());
}

#[tokio::test]
async fn first_turn_generates_a_title() {
    let harness = Harness::new(vec![Reply::Events(text_reply("Hello"))], vec![]).await;
    harness.say("Hi").await.expect("loop result");

    let sessions = harness.runtime().sessions.clone();
    let id = harness.session.id.clone();
    let mut title = String::new();
    for _ in 0..100 {
        title = sessions.get(&id).await.expect("session").title;
        if title == GENERATED_TITLE {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(title, GENERATED_TITLE);
}

#[tokio::test]
async fn concurrent_callers_share_one_loop() {
    let harness = Harness::new(
        vec![Reply::Delayed(
            Duration::from_millis(200),
            text_reply("only once"),
        )],
        vec![],
    )
    .await;
    let mut input = harness.input(vec![PromptPart::text("Hi")]);
    input.no_reply = true;
    let queued = harness.coordinator.prompt(input).await.expect("queued");
    assert!(queued.info.is_user());
    assert_eq!(harness.provider.calls(), 0);

    let id = harness.session.id.clone();
    let (first, second) = tokio::join!(
        harness.coordinator.run_loop(&id),
        harness.coordinator.run_loop(&id)
    );
    let first = first.expect("first caller");
    let second = second.expect("second caller");

    assert_eq!(first.info.id(), second.info.id());
    assert_eq!(harness.provider.calls(), 1);
    assert!(!harness.coordinator.is_busy(&id));
}

#[tokio::test]
async fn cancel_aborts_the_running_reply() {
    let harness = Harness::new(
        vec![Reply::Hang(vec![
            StreamEvent::Start,
            StreamEvent::text("partial answer"),
        ])],
        vec![],
    )
    .await;
    let coordinator = harness.coordinator.clone();
    let input = harness.input(vec![PromptPart::text("write a long essay")]);
    let running = tokio::spawn(async move { coordinator.prompt(input).await });

    let provider = harness.provider.clone();
    assert!(eventually(|| provider.calls() == 1).await);
    let id = harness.session.id.clone();
    assert!(harness.coordinator.is_busy(&id));
    assert!(matches!(
        harness.coordinator.assert_not_busy(&id),
        Err(StewardError::SessionBusy(_))
    ));

    harness.coordinator.cancel(&id);
    let reply = running.await.expect("join").expect("loop result");

    let assistant = reply.info.as_assistant().expect("assistant");
    assert!(assistant.error.as_ref().is_some_and(MessageError::is_aborted));
    assert!(assistant.time.completed.is_some());
    assert!(!harness.coordinator.is_busy(&id));
    assert_eq!(harness.runtime().status.get(&id), SessionStatus::Idle);
}

#[tokio::test]
async fn tool_results_feed_the_next_step() {
    let echo = Arc::new(EchoTool::default());
    let harness = Harness::new(
        vec![
            Reply::Events(tool_reply("call_1", "echo", json!({ "text": "ping" }))),
            Reply::Events(text_reply("Echo said ping.")),
        ],
        vec![echo.clone()],
    )
    .await;

    let reply = harness.say("echo ping").await.expect("loop result");

    assert_eq!(texts(&reply.parts), vec!["Echo said ping.".to_string()]);
    assert_eq!(echo.runs.load(Ordering::SeqCst), 1);

    let messages = harness.messages().await;
    assert_eq!(messages.len(), 3);
    assert_eq!(assistant_finish(&messages[1]).as_deref(), Some("tool-calls"));
    let tool_state = messages[1]
        .parts
        .iter()
        .find_map(|p| p.tool_state())
        .expect("tool part");
    assert!(matches!(tool_state, ToolState::Completed { output, .. } if output == "ping"));

    let requests = harness.provider.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].tools.len(), 1);
    let has_result = requests[1].messages.iter().any(|m| {
        m.role == ModelRole::Tool
            && m.content.iter().any(|c| {
                matches!(c, ModelContent::ToolResult { call_id, output, is_error: false, .. }
                    if call_id == "call_1" && output == "ping")
            })
    });
    assert!(has_result);
}

#[tokio::test]
async fn fourth_identical_call_asks_before_running() {
    let echo = Arc::new(EchoTool::default());
    let same = json!({ "text": "again" });
    let harness = Harness::new(
        vec![
            Reply::Events(tool_reply("call_1", "echo", same.clone())),
            Reply::Events(tool_reply("call_2", "echo", same.clone())),
            Reply::Events(tool_reply("call_3", "echo", same.clone())),
            Reply::Events(tool_reply("call_4", "echo", same.clone())),
            Reply::Events(text_reply("stopping")),
        ],
        vec![echo.clone()],
    )
    .await;
    let coordinator = harness.coordinator.clone();
    let input = harness.input(vec![PromptPart::text("loop forever")]);
    let running = tokio::spawn(async move { coordinator.prompt(input).await });

    let permission = harness.runtime().permission.clone();
    assert!(eventually(|| !permission.list().is_empty()).await);
    let pending = permission.list();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].permission_type, "doom_loop");
    assert_eq!(pending[0].pattern, Some(vec!["echo".to_string()]));
    assert_eq!(echo.runs.load(Ordering::SeqCst), 3);

    assert!(permission.respond(&harness.session.id, &pending[0].id, PermissionResponse::Once));
    let reply = running.await.expect("join").expect("loop result");

    assert_eq!(texts(&reply.parts), vec!["stopping".to_string()]);
    assert_eq!(echo.runs.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn rejected_permission_stops_the_loop() {
    let harness = Harness::new(
        vec![
            Reply::Events(tool_reply("call_1", "bash", json!({ "command": "rm -rf build" }))),
            Reply::Events(text_reply("never sent")),
        ],
        vec![Arc::new(GuardedTool)],
    )
    .await;
    let coordinator = harness.coordinator.clone();
    let input = harness.input(vec![PromptPart::text("clean the build")]);
    let running = tokio::spawn(async move { coordinator.prompt(input).await });

    let permission = harness.runtime().permission.clone();
    assert!(eventually(|| !permission.list().is_empty()).await);
    let pending = permission.list();
    assert_eq!(pending[0].permission_type, "bash");
    assert!(permission.respond(&harness.session.id, &pending[0].id, PermissionResponse::Reject));

    let reply = running.await.expect("join").expect("loop result");
    assert_eq!(assistant_finish(&reply).as_deref(), Some("tool-calls"));
    let state = reply.parts.iter().find_map(|p| p.tool_state()).expect("tool part");
    assert!(matches!(state, ToolState::Error { error, .. } if error == DEFAULT_REJECTION_MESSAGE));
    assert_eq!(harness.provider.calls(), 1);
}

#[tokio::test]
async fn rejection_can_continue_the_loop() {
    let mut config = CoreConfig::default();
    config.experimental.continue_loop_on_deny = true;
    let harness = Harness::with_config(
        vec![
            Reply::Events(tool_reply("call_1", "bash", json!({ "command": "rm -rf build" }))),
            Reply::Events(text_reply("Understood, skipping that.")),
        ],
        vec![Arc::new(GuardedTool)],
        config,
    )
    .await;
    let coordinator = harness.coordinator.clone();
    let input = harness.input(vec![PromptPart::text("clean the build")]);
    let running = tokio::spawn(async move { coordinator.prompt(input).await });

    let permission = harness.runtime().permission.clone();
    assert!(eventually(|| !permission.list().is_empty()).await);
    let pending = permission.list();
    assert!(permission.respond(&harness.session.id, &pending[0].id, PermissionResponse::Reject));

    let reply = running.await.expect("join").expect("loop result");
    assert_eq!(texts(&reply.parts), vec!["Understood, skipping that.".to_string()]);
    assert_eq!(harness.provider.calls(), 2);
}

#[tokio::test]
async fn retryable_error_waits_and_retries() {
    let mut headers = BTreeMap::new();
    headers.insert("retry-after-ms".to_string(), "20".to_string());
    let harness = Harness::new(
        vec![
            Reply::Fail(ProviderError::ApiCall {
                message: "Overloaded".to_string(),
                status_code: Some(529),
                is_retryable: true,
                response_headers: Some(headers),
                response_body: None,
            }),
            Reply::Events(text_reply("Back again")),
        ],
        vec![],
    )
    .await;

    let reply = harness.say("Hi").await.expect("loop result");

    assert_eq!(harness.provider.calls(), 2);
    assert_eq!(texts(&reply.parts), vec!["Back again".to_string()]);
    let assistant = reply.info.as_assistant().expect("assistant");
    assert!(assistant.error.is_none());
    let retry = reply
        .parts
        .iter()
        .find_map(|p| match &p.data {
            PartData::Retry { attempt, error, .. } => Some((*attempt, error.clone())),
            _ => None,
        })
        .expect("retry part");
    assert_eq!(retry.0, 1);
    assert!(matches!(retry.1, MessageError::Api(_)));
}

#[tokio::test]
async fn non_retryable_error_is_recorded() {
    let harness = Harness::new(
        vec![Reply::Fail(ProviderError::api("invalid request", Some(400), false))],
        vec![],
    )
    .await;

    let reply = harness.say("Hi").await.expect("loop result");

    assert_eq!(harness.provider.calls(), 1);
    let assistant = reply.info.as_assistant().expect("assistant");
    match &assistant.error {
        Some(MessageError::Api(data)) => {
            assert_eq!(data.message, "invalid request");
            assert_eq!(data.status_code, Some(400));
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(
        harness.runtime().status.get(&harness.session.id),
        SessionStatus::Idle
    );
}

#[tokio::test]
async fn subtask_part_runs_the_task_tool() {
    let task = Arc::new(TaskTool::default());
    let harness = Harness::new(vec![Reply::Events(text_reply("All done."))], vec![task.clone()]).await;

    let reply = harness
        .coordinator
        .prompt(harness.input(vec![PromptPart::Subtask {
            prompt: "list the config files".to_string(),
            description: "explore".to_string(),
            agent: "general".to_string(),
            command: None,
        }]))
        .await
        .expect("loop result");

    assert_eq!(texts(&reply.parts), vec!["All done.".to_string()]);
    let calls = task.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0]["prompt"], "list the config files");
    assert_eq!(calls[0]["subagent_type"], "general");
    assert_eq!(calls[0]["description"], "explore");

    let messages = harness.messages().await;
    // user, subtask reply, synthetic follow-up, final reply
    assert_eq!(messages.len(), 4);
    let subtask = messages[1].info.as_assistant().expect("subtask reply");
    assert_eq!(subtask.agent, "general");
    assert_eq!(subtask.finish.as_deref(), Some("tool-calls"));
    assert!(matches!(
        messages[1].parts[0].tool_state(),
        Some(ToolState::Completed { output, .. }) if output == "sub-agent found three files"
    ));
    assert!(messages[2].info.is_user());
    assert!(messages[2].parts.iter().all(|p| p.is_synthetic_text()));
    assert_eq!(harness.provider.calls(), 1);
}

#[tokio::test]
async fn missing_task_tool_records_a_failed_part() {
    let harness = Harness::new(vec![Reply::Events(text_reply("Could not delegate."))], vec![]).await;

    harness
        .coordinator
        .prompt(harness.input(vec![PromptPart::Subtask {
            prompt: "look around".to_string(),
            description: "explore".to_string(),
            agent: "general".to_string(),
            command: None,
        }]))
        .await
        .expect("loop result");

    let messages = harness.messages().await;
    assert!(matches!(
        messages[1].parts[0].tool_state(),
        Some(ToolState::Error { error, .. }) if error.starts_with("Tool execution failed: ")
    ));
}

#[tokio::test]
async fn overflow_compacts_and_resumes() {
    let echo = Arc::new(EchoTool::default());
    let harness = Harness::new(
        vec![
            Reply::Events(tool_reply_with_usage(
                "call_1",
                "echo",
                json!({ "text": "huge" }),
                usage(190_000, 500),
            )),
            Reply::Events(text_reply("We were echoing text.")),
            Reply::Events(text_reply("Resumed after summary.")),
        ],
        vec![echo],
    )
    .await;

    let reply = harness.say("original request").await.expect("loop result");

    assert_eq!(texts(&reply.parts), vec!["Resumed after summary.".to_string()]);
    assert_eq!(harness.provider.calls(), 3);

    let messages = harness.messages().await;
    let compaction = messages
        .iter()
        .find(|m| {
            m.parts
                .iter()
                .any(|p| matches!(p.data, PartData::Compaction { auto: true }))
        })
        .expect("compaction request");
    let summary = messages
        .iter()
        .filter_map(|m| m.info.as_assistant())
        .find(|a| a.summary)
        .expect("summary reply");
    assert_eq!(summary.parent_id, compaction.info.id());
    assert_eq!(summary.finish.as_deref(), Some("stop"));

    // After the summary, the original request is no longer sent.
    let last = harness.provider.requests().pop().expect("request");
    let mentions_original = last.messages.iter().any(|m| {
        m.content
            .iter()
            .any(|c| matches!(c, ModelContent::Text { text } if text.contains("original request")))
    });
    assert!(!mentions_original);
}

#[tokio::test]
async fn last_step_disables_tools() {
    let mut config = CoreConfig::default();
    config.agents.insert(
        "build".to_string(),
        AgentConfig {
            max_steps: Some(1),
            ..Default::default()
        },
    );
    let harness = Harness::with_config(
        vec![Reply::Events(text_reply("Summary of progress."))],
        vec![Arc::new(EchoTool::default())],
        config,
    )
    .await;

    harness.say("do everything").await.expect("loop result");

    let request = harness.provider.requests().pop().expect("request");
    assert!(request.tools.is_empty());
    let last = request.messages.last().expect("message");
    assert_eq!(last.role, ModelRole::Assistant);
    assert!(matches!(&last.content[0], ModelContent::Text { text } if text == MAX_STEPS_PROMPT));
}

#[tokio::test]
async fn revert_drops_later_history_on_next_prompt() {
    let harness = Harness::new(
        vec![
            Reply::Events(text_reply("first answer")),
            Reply::Events(text_reply("second answer")),
        ],
        vec![],
    )
    .await;
    harness.say("first").await.expect("first turn");
    // Let the background jobs of the first turn settle.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let first_user = harness.messages().await[0].info.id().to_string();

    harness
        .runtime()
        .sessions
        .update(&harness.session.id, move |s| {
            s.revert = Some(SessionRevert {
                message_id: first_user,
                part_id: None,
                snapshot: None,
                diff: None,
            })
        })
        .await
        .expect("set revert");
    harness.say("second").await.expect("second turn");

    let messages = harness.messages().await;
    assert_eq!(messages.len(), 2);
    assert_eq!(texts(&messages[0].parts), vec!["second".to_string()]);
    let session = harness
        .runtime()
        .sessions
        .get(&harness.session.id)
        .await
        .expect("session");
    assert!(session.revert.is_none());
}

#[tokio::test]
async fn prompt_without_model_uses_the_previous_one() {
    let harness = Harness::new(
        vec![
            Reply::Events(text_reply("one")),
            Reply::Events(text_reply("two")),
        ],
        vec![],
    )
    .await;
    harness.say("first").await.expect("first turn");

    let mut input = harness.input(vec![PromptPart::text("second")]);
    input.model = None;
    harness.coordinator.prompt(input).await.expect("second turn");

    let users: Vec<_> = harness
        .messages()
        .await
        .into_iter()
        .filter_map(|m| match m.info {
            MessageInfo::User(user) => Some(user),
            _ => None,
        })
        .collect();
    assert_eq!(users.len(), 2);
    assert_eq!(users[1].model.model_id, MODEL);
}

#[tokio::test]
async fn remove_session_cancels_and_deletes() {
    let harness = Harness::new(vec![Reply::Hang(vec![])], vec![]).await;
    let coordinator = harness.coordinator.clone();
    let input = harness.input(vec![PromptPart::text("Hi")]);
    let running = tokio::spawn(async move { coordinator.prompt(input).await });

    let provider = harness.provider.clone();
    assert!(eventually(|| provider.calls() == 1).await);
    harness
        .coordinator
        .remove_session(&harness.session.id)
        .await
        .expect("remove");

    let _ = running.await.expect("join");
    let err = harness
        .runtime()
        .sessions
        .get(&harness.session.id)
        .await
        .expect_err("removed");
    assert!(err.is_not_found());
}

#[tokio::test]
async fn file_changes_land_in_patch_and_turn_summary() {
    let harness = Harness::build(vec![Reply::Events(text_reply("Edited main."))], |builder| {
        builder.snapshot(Arc::new(FixedSnapshot {
            files: vec!["src/main.rs".to_string()],
        }))
    })
    .await;

    let reply = harness.say("edit main").await.expect("loop result");
    let patched = reply.parts.iter().find_map(|p| match &p.data {
        PartData::Patch { files, .. } => Some(files.clone()),
        _ => None,
    });
    assert_eq!(patched, Some(vec!["src/main.rs".to_string()]));

    assert_eq!(summary_files(&harness, 1).await, vec!["src/main.rs".to_string()]);
}

/// Files on the first user message's summary, once `count` of them are there.
async fn summary_files(harness: &Harness, count: usize) -> Vec<String> {
    let mut files = Vec::new();
    for _ in 0..100 {
        let messages = harness.messages().await;
        files = messages[0]
            .info
            .as_user()
            .and_then(|u| u.summary.clone())
            .map(|s| s.diffs.into_iter().map(|d| d.file).collect())
            .unwrap_or_default();
        if files.len() >= count {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    files
}

#[tokio::test]
async fn turn_summary_keeps_files_from_every_step() {
    let echo = Arc::new(EchoTool::default());
    let harness = Harness::build(
        vec![
            Reply::Events(tool_reply("call_1", "echo", json!({ "text": "write" }))),
            Reply::Events(text_reply("Both files written.")),
        ],
        |builder| {
            builder
                .tool(echo.clone())
                .snapshot(Arc::new(SequencedSnapshot::default()))
        },
    )
    .await;

    harness.say("write two files").await.expect("loop result");

    assert_eq!(
        summary_files(&harness, 2).await,
        vec!["src/file_1.rs".to_string(), "src/file_2.rs".to_string()]
    );
    // Late summary passes must not shrink the list again.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(summary_files(&harness, 2).await.len(), 2);
}

#[tokio::test]
async fn failing_tool_hook_settles_the_subtask() {
    let task = Arc::new(TaskTool::default());
    let harness = Harness::build(
        vec![Reply::Events(text_reply("Delegation was refused."))],
        |builder| builder.tool(task.clone()).plugin(Arc::new(VetoPlugin)),
    )
    .await;

    let reply = harness
        .coordinator
        .prompt(harness.input(vec![PromptPart::Subtask {
            prompt: "look around".to_string(),
            description: "explore".to_string(),
            agent: "general".to_string(),
            command: None,
        }]))
        .await
        .expect("loop result");
    assert_eq!(texts(&reply.parts), vec!["Delegation was refused.".to_string()]);
    assert!(task.calls.lock().unwrap().is_empty());

    let messages = harness.messages().await;
    assert_eq!(messages.len(), 4);
    let subtask = messages[1].info.as_assistant().expect("subtask reply");
    assert_eq!(subtask.finish.as_deref(), Some("tool-calls"));
    assert!(subtask.time.completed.is_some());
    assert!(matches!(
        messages[1].parts[0].tool_state(),
        Some(ToolState::Error { error, .. })
            if error.starts_with("Tool execution failed: ") && error.contains("task is not allowed here")
    ));

    // The subtask is settled, so another loop has nothing left to do.
    let again = harness
        .coordinator
        .run_loop(&harness.session.id)
        .await
        .expect("second loop");
    assert_eq!(again.info.id(), reply.info.id());
    assert_eq!(harness.messages().await.len(), 4);
    assert_eq!(harness.provider.calls(), 1);
}

#[tokio::test]
async fn cancel_rejects_joined_callers() {
    let harness = Harness::new(
        vec![Reply::Hang(vec![
            StreamEvent::Start,
            StreamEvent::text("thinking"),
        ])],
        vec![],
    )
    .await;
    let coordinator = harness.coordinator.clone();
    let input = harness.input(vec![PromptPart::text("take your time")]);
    let owner = tokio::spawn(async move { coordinator.prompt(input).await });

    let provider = harness.provider.clone();
    assert!(eventually(|| provider.calls() == 1).await);

    let coordinator = harness.coordinator.clone();
    let id = harness.session.id.clone();
    let joined = tokio::spawn(async move { coordinator.run_loop(&id).await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    harness.coordinator.cancel(&harness.session.id);

    let joined = joined.await.expect("join");
    assert!(matches!(joined, Err(StewardError::Cancelled(_))));
    let reply = owner.await.expect("join").expect("loop result");
    let assistant = reply.info.as_assistant().expect("assistant");
    assert!(assistant.error.as_ref().is_some_and(MessageError::is_aborted));
    assert_eq!(harness.provider.calls(), 1);
}

#[tokio::test]
async fn bare_text_and_finish_stream() {
    let harness = Harness::new(
        vec![Reply::Events(vec![
            StreamEvent::text("Hi"),
            StreamEvent::Finish {
                finish_reason: Some("stop".to_string()),
            },
        ])],
        vec![],
    )
    .await;

    let reply = harness.say("Hello").await.expect("loop result");

    assert_eq!(texts(&reply.parts), vec!["Hi".to_string()]);
    assert_eq!(assistant_finish(&reply).as_deref(), Some("stop"));
    assert!(reply
        .info
        .as_assistant()
        .is_some_and(|a| a.time.completed.is_some() && a.error.is_none()));
    assert!(!reply
        .parts
        .iter()
        .any(|p| matches!(p.data, PartData::StepStart { .. } | PartData::StepFinish { .. })));
    assert_eq!(harness.messages().await.len(), 2);
    assert_eq!(harness.provider.calls(), 1);
}

#[tokio::test]
async fn pending_sibling_call_does_not_hide_a_repeat() {
    let echo = Arc::new(EchoTool::default());
    let same = json!({ "text": "again" });
    let harness = Harness::new(
        vec![
            Reply::Events(tool_reply("call_1", "echo", same.clone())),
            Reply::Events(tool_reply("call_2", "echo", same.clone())),
            Reply::Events(tool_reply("call_3", "echo", same.clone())),
            Reply::Events(vec![
                StreamEvent::Start,
                StreamEvent::StartStep,
                StreamEvent::ToolInputStart {
                    id: "call_side".to_string(),
                    tool_name: "echo".to_string(),
                },
                StreamEvent::tool_call("call_4", "echo", same.clone()),
                StreamEvent::finish_step("tool-calls", usage(150, 20)),
                StreamEvent::Finish {
                    finish_reason: Some("tool-calls".to_string()),
                },
            ]),
            Reply::Events(text_reply("stopping")),
        ],
        vec![echo.clone()],
    )
    .await;
    let coordinator = harness.coordinator.clone();
    let input = harness.input(vec![PromptPart::text("loop forever")]);
    let running = tokio::spawn(async move { coordinator.prompt(input).await });

    let permission = harness.runtime().permission.clone();
    assert!(eventually(|| !permission.list().is_empty()).await);
    let pending = permission.list();
    assert_eq!(pending[0].permission_type, "doom_loop");
    assert_eq!(echo.runs.load(Ordering::SeqCst), 3);

    assert!(permission.respond(&harness.session.id, &pending[0].id, PermissionResponse::Once));
    let reply = running.await.expect("join").expect("loop result");
    assert_eq!(texts(&reply.parts), vec!["stopping".to_string()]);
    assert_eq!(echo.runs.load(Ordering::SeqCst), 4);
}
