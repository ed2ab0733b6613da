//! End-to-end turns against a scripted model and an in-memory provider.

mod support;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use toolchat::agent_core::tokens::estimate_chat_tokens;
use toolchat::agent_core::{
    AbortReason, Agent, AgentSettings, ContextBudget, Conversation, LoopState, Message, Role,
    TerminalState, ToolErrorKind,
};
use toolchat::inference::Role as ChatRole;
use toolchat::mcp_client::Liveness;

use support::{
    agent_with, dispatcher_for, respond, tool_call, web_tools, FakeProvider, Reply, ScriptedModel,
};

fn search_provider() -> FakeProvider {
    FakeProvider::new(web_tools(), |name, args| match name {
        "web_search" => Reply::Text(format!(
            "1. Rust 1.80 released ({})",
            args["query"].as_str().unwrap_or_default()
        )),
        "fetch_webpage" => Reply::Text(format!(
            "Page text of {}",
            args["url"].as_str().unwrap_or_default()
        )),
        other => Reply::Error(format!("no such tool {other}")),
    })
}

#[tokio::test]
async fn test_scenario_a_direct_answer() {
    let model = ScriptedModel::new([respond("4")]);
    let (agent, _pool) =
        agent_with(model.clone(), search_provider(), None, AgentSettings::default()).await;

    let mut conversation = Conversation::new();
    let outcome = agent
        .run_turn(&mut conversation, "what is 2+2", &[], CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.final_text, "4");
    assert_eq!(outcome.state, TerminalState::Completed);
    assert_eq!(outcome.iterations, 1);
    assert!(outcome.transcript.is_empty());
    assert_eq!(model.calls(), 1);
}

#[tokio::test]
async fn test_scenario_b_search_then_answer() {
    let model = ScriptedModel::new([
        tool_call("web_search", json!({"query": "latest rust release"})),
        respond("Rust 1.80 is the latest release."),
    ]);
    let (agent, _pool) =
        agent_with(model.clone(), search_provider(), None, AgentSettings::default()).await;

    let mut conversation = Conversation::new();
    let outcome = agent
        .run_turn(&mut conversation, "latest rust release?", &[], CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.final_text, "Rust 1.80 is the latest release.");
    assert_eq!(outcome.transcript.len(), 1);
    let entry = &outcome.transcript[0];
    assert_eq!(entry.tool_name, "web_search");
    assert!(entry.success);
    assert_eq!(entry.arguments["query"], "latest rust release");

    // The second decision sees the folded result as a user-role message.
    let prompt = model.prompt(1);
    let last = prompt.last().unwrap();
    assert_eq!(last.role, ChatRole::User);
    assert!(last
        .content
        .starts_with("[Tool: web_search]\n1. Rust 1.80 released"));

    let roles: Vec<Role> = conversation.messages.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![Role::User, Role::Assistant, Role::Tool, Role::Assistant]
    );
}

#[tokio::test]
async fn test_scenario_c_typo_is_reported_then_corrected() {
    let model = ScriptedModel::new([
        tool_call("fetch_webpag", json!({"url": "https://example.com"})),
        tool_call("fetch_webpage", json!({"url": "https://example.com"})),
        respond("The page says hello."),
    ]);
    let (agent, _pool) =
        agent_with(model.clone(), search_provider(), None, AgentSettings::default()).await;

    let mut conversation = Conversation::new();
    let outcome = agent
        .run_turn(&mut conversation, "read example.com", &[], CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.state, TerminalState::Completed);
    assert_eq!(outcome.transcript.len(), 2);
    assert_eq!(outcome.transcript[0].tool_name, "fetch_webpag");
    assert_eq!(
        outcome.transcript[0].error_kind,
        Some(ToolErrorKind::UnknownTool)
    );
    assert_eq!(outcome.transcript[1].tool_name, "fetch_webpage");
    assert!(outcome.transcript[1].success);

    let binding = model.prompt(1);
    let feedback = &binding.last().unwrap().content;
    assert!(feedback.starts_with("[Tool: fetch_webpag - Failed]"));
    assert!(feedback.contains("Did you mean: fetch_webpage"));
}

#[tokio::test]
async fn test_scenario_d_timeout_then_answer() {
    let provider = FakeProvider::new(web_tools(), |name, _| match name {
        "fetch_webpage" => Reply::Hang,
        _ => Reply::Text("ok".into()),
    });
    let model = ScriptedModel::new([
        tool_call("fetch_webpage", json!({"url": "https://slow.example"})),
        respond("The site did not respond in time."),
    ]);
    let (agent, _pool) = agent_with(
        model.clone(),
        provider,
        Some(Duration::from_millis(100)),
        AgentSettings::default(),
    )
    .await;

    let mut conversation = Conversation::new();
    let outcome = agent
        .run_turn(&mut conversation, "fetch it", &[], CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.state, TerminalState::Completed);
    assert_eq!(outcome.final_text, "The site did not respond in time.");
    assert_eq!(outcome.transcript.len(), 1);
    assert_eq!(outcome.transcript[0].error_kind, Some(ToolErrorKind::Timeout));
    assert!(model
        .prompt(1)
        .last()
        .unwrap()
        .content
        .contains("timed out after 100ms"));
}

#[tokio::test]
async fn test_scenario_e_iteration_cap_aborts_with_summary() {
    let executed = Arc::new(AtomicUsize::new(0));
    let counter = executed.clone();
    let provider = FakeProvider::new(web_tools(), move |_, args| {
        counter.fetch_add(1, Ordering::SeqCst);
        Reply::Text(format!("result for {}", args["query"].as_str().unwrap_or_default()))
    });
    let replies: Vec<String> = (1..=9)
        .map(|n| tool_call("web_search", json!({"query": format!("q{n}")})))
        .collect();
    let model = ScriptedModel::new(replies);
    let (agent, _pool) =
        agent_with(model.clone(), provider, None, AgentSettings::default()).await;

    let mut conversation = Conversation::new();
    let outcome = agent
        .run_turn(&mut conversation, "keep searching", &[], CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.state, TerminalState::Aborted(AbortReason::IterationCap));
    assert_eq!(executed.load(Ordering::SeqCst), 8);
    assert_eq!(outcome.transcript.len(), 8);
    assert_eq!(model.calls(), 9);
    assert!(outcome.final_text.contains("limit of 8 tool calls"));
    assert!(outcome.final_text.contains("web_search: result for q8"));
    assert_eq!(outcome.state_trace.last(), Some(&LoopState::Aborted));
    assert_eq!(conversation.last().unwrap().content, outcome.final_text);
}

#[tokio::test]
async fn test_cancel_mid_tool_leaves_no_orphaned_call() {
    let provider = FakeProvider::new(web_tools(), |_, _| Reply::Hang);
    let model = ScriptedModel::new([tool_call("web_search", json!({"query": "x"}))]);
    let (agent, _pool) =
        agent_with(model.clone(), provider, None, AgentSettings::default()).await;

    let handle = agent.spawn_turn(Conversation::new(), "search x".into(), Vec::new());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!handle.is_finished());
    handle.cancel();

    let finished = handle.wait().await.unwrap();
    let outcome = finished.result.unwrap();
    assert_eq!(outcome.state, TerminalState::Cancelled);
    assert_eq!(outcome.transcript.len(), 1);
    assert_eq!(
        outcome.transcript[0].error_kind,
        Some(ToolErrorKind::Cancelled)
    );
    // Only the user message: the call and its result are folded together or not at all.
    assert_eq!(finished.conversation.len(), 1);
    assert_eq!(finished.conversation.messages[0].role, Role::User);
}

#[tokio::test]
async fn test_time_budget_aborts_hanging_tool() {
    let provider = FakeProvider::new(web_tools(), |_, _| Reply::Hang);
    let model = ScriptedModel::new([tool_call("web_search", json!({"query": "x"}))]);
    let settings = AgentSettings {
        turn_timeout: Duration::from_millis(200),
        ..AgentSettings::default()
    };
    let (agent, _pool) = agent_with(model, provider, None, settings).await;

    let mut conversation = Conversation::new();
    let outcome = agent
        .run_turn(&mut conversation, "search x", &[], CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.state, TerminalState::Aborted(AbortReason::TimeBudget));
    assert!(outcome.final_text.contains("ran out of time"));
    let roles: Vec<Role> = conversation.messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::User, Role::Assistant]);
}

#[tokio::test]
async fn test_malformed_decision_is_repaired() {
    let model = ScriptedModel::new([
        "Sure! Let me think about that.".to_string(),
        respond("Fixed."),
    ]);
    let (agent, _pool) =
        agent_with(model.clone(), search_provider(), None, AgentSettings::default()).await;

    let outcome = agent
        .run_turn(&mut Conversation::new(), "hi", &[], CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.final_text, "Fixed.");
    assert_eq!(outcome.model_calls, 2);
    assert_eq!(outcome.iterations, 1);
    assert!(model
        .prompt(1)
        .last()
        .unwrap()
        .content
        .contains("not a valid decision"));
}

#[tokio::test]
async fn test_repeated_timeouts_restart_provider() {
    let provider = FakeProvider::new(web_tools(), |name, _| match name {
        "fetch_webpage" => Reply::Hang,
        _ => Reply::Text("found".into()),
    });
    let launches = provider.launches();
    let model = ScriptedModel::new([
        tool_call("fetch_webpage", json!({"url": "a"})),
        tool_call("fetch_webpage", json!({"url": "b"})),
        tool_call("fetch_webpage", json!({"url": "c"})),
        tool_call("web_search", json!({"query": "d"})),
        respond("done"),
    ]);
    let (agent, pool) = agent_with(
        model,
        provider,
        Some(Duration::from_millis(50)),
        AgentSettings::default(),
    )
    .await;

    let outcome = agent
        .run_turn(&mut Conversation::new(), "go", &[], CancellationToken::new())
        .await
        .unwrap();

    let kinds: Vec<Option<ToolErrorKind>> =
        outcome.transcript.iter().map(|e| e.error_kind).collect();
    assert_eq!(
        kinds,
        vec![
            Some(ToolErrorKind::Timeout),
            Some(ToolErrorKind::Timeout),
            Some(ToolErrorKind::Timeout),
            None
        ]
    );
    assert_eq!(launches.load(Ordering::SeqCst), 2);
    assert_eq!(pool.liveness("web"), Some(Liveness::Ready));
}

#[tokio::test]
async fn test_long_history_is_trimmed_before_each_decision() {
    let model = ScriptedModel::new([respond("short answer")]);
    let (dispatcher, _pool) = dispatcher_for(search_provider(), None).await;
    let budget = ContextBudget {
        context_window: 3_000,
        output_reservation: 256,
        safety_buffer: 64,
    };
    let agent = Agent::new(model.clone(), dispatcher, budget, AgentSettings::default());

    let mut conversation = Conversation::new();
    for n in 0..40 {
        conversation
            .messages
            .push(Message::user(format!("question {n}: {}", "lorem ipsum ".repeat(40))));
        conversation
            .messages
            .push(Message::assistant(format!("answer {n}: {}", "dolor sit ".repeat(40))));
    }

    agent
        .run_turn(&mut conversation, "latest question", &[], CancellationToken::new())
        .await
        .unwrap();

    let prompt = model.prompt(0);
    assert_eq!(prompt[0].role, ChatRole::System);
    assert_eq!(prompt.last().unwrap().content, "latest question");
    assert!(prompt.len() < 1 + 81);
    assert!(estimate_chat_tokens(&prompt) <= 3_000 - 256 - 64);
    // Trimming shapes the prompt only; the conversation keeps everything.
    assert_eq!(conversation.len(), 80 + 2);
}

#[tokio::test]
async fn test_history_carries_across_turns() {
    let model = ScriptedModel::new([
        tool_call("web_search", json!({"query": "rust"})),
        respond("Rust 1.80."),
        respond("I already told you: Rust 1.80."),
    ]);
    let (agent, _pool) =
        agent_with(model.clone(), search_provider(), None, AgentSettings::default()).await;

    let mut conversation = Conversation::new();
    agent
        .run_turn(&mut conversation, "latest rust?", &[], CancellationToken::new())
        .await
        .unwrap();
    let second = agent
        .run_turn(&mut conversation, "again?", &[], CancellationToken::new())
        .await
        .unwrap();

    assert!(second.transcript.is_empty());
    let prompt = model.prompt(2);
    assert!(prompt
        .iter()
        .any(|m| m.content.starts_with("[Tool: web_search]")));
    assert_eq!(conversation.len(), 4 + 2);
}
