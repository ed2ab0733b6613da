//! Orchestration loop: one user turn, from message to final answer.
//!
//! ```text
//! AwaitingDecision ──tool_call──▶ Executing ──▶ FoldResult ──▶ AwaitingDecision
//!        │
//!        └──respond──▶ Done
//! AwaitingDecision / Executing ──cancel──▶ Cancelled
//! tool-call cap or turn deadline ──▶ Aborted (best-effort answer)
//! ```
//!
//! Steps within a turn are strictly sequential. The decision message and its
//! tool result are appended to the conversation together in FoldResult, so a
//! cancelled or aborted turn never leaves a call without its result. The
//! history is re-trimmed before every decision.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::{AgentConfig, AppConfig};
use crate::inference::ChatModel;
use crate::mcp_client::{ProviderPool, ToolRegistry};
use crate::retrieval::RetrievalChunk;

use super::budget::{trim, ContextBudget};
use super::decision::{DecisionEngine, DecisionSchema};
use super::errors::AgentError;
use super::fold::{decision_message, fold_tool_result, transcript_entry};
use super::policy::ToolPolicy;
use super::prompt::{assemble, build_grounding_section, build_system_prompt, prompt_head};
use super::tokens::estimate_chat_tokens;
use super::tool_router::Dispatcher;
use super::types::{
    Conversation, Decision, Message, ToolErrorKind, ToolInvocation, ToolResult, TranscriptEntry,
};

/// Successful results listed in a best-effort answer.
const BEST_EFFORT_MAX_RESULTS: usize = 5;

// ─── Types ──────────────────────────────────────────────────────────────────

/// States of the per-turn loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    AwaitingDecision,
    Executing,
    FoldResult,
    Done,
    Cancelled,
    Aborted,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LoopState::AwaitingDecision => "awaiting_decision",
            LoopState::Executing => "executing",
            LoopState::FoldResult => "fold_result",
            LoopState::Done => "done",
            LoopState::Cancelled => "cancelled",
            LoopState::Aborted => "aborted",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// More tool calls were requested than `max_iterations` allows.
    IterationCap,
    /// The turn's wall-clock budget ran out.
    TimeBudget,
}

/// How a turn ended. None of these is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum TerminalState {
    Completed,
    Cancelled,
    Aborted(AbortReason),
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnOutcome {
    pub final_text: String,
    /// Every tool call of the turn, in call order.
    pub transcript: Vec<TranscriptEntry>,
    pub state: TerminalState,
    /// Decisions made (loop passes).
    pub iterations: u32,
    /// Model calls, including repair attempts.
    pub model_calls: u32,
    /// States visited, in order.
    pub state_trace: Vec<LoopState>,
    pub elapsed_ms: u64,
}

/// Loop caps and behavior switches.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Tool calls allowed per turn.
    pub max_iterations: u32,
    pub turn_timeout: Duration,
    pub max_tool_result_chars: usize,
    pub max_repair_attempts: u32,
    /// Consecutive identical repeats tolerated before a call is refused.
    pub max_duplicate_calls: usize,
    pub enforce_tool_enum: bool,
    pub system_prompt: Option<String>,
}

impl From<&AgentConfig> for AgentSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            max_iterations: config.max_iterations,
            turn_timeout: Duration::from_secs(config.turn_timeout_secs),
            max_tool_result_chars: config.max_tool_result_chars,
            max_repair_attempts: config.max_repair_attempts,
            max_duplicate_calls: config.max_duplicate_calls,
            enforce_tool_enum: config.enforce_tool_enum,
            system_prompt: config.system_prompt.clone(),
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self::from(&AgentConfig::default())
    }
}

enum Terminal {
    Completed(String),
    Cancelled,
    Aborted(AbortReason),
}

/// Outcome of waiting on a suspension point.
enum Bounded<T> {
    Ready(T),
    Cancelled,
    OutOfTime,
}

async fn bounded<F: Future>(
    future: F,
    cancel: &CancellationToken,
    deadline: Instant,
) -> Bounded<F::Output> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Bounded::Cancelled,
        result = tokio::time::timeout_at(deadline, future) => match result {
            Ok(value) => Bounded::Ready(value),
            Err(_) => Bounded::OutOfTime,
        },
    }
}

// ─── Agent ──────────────────────────────────────────────────────────────────

/// Runs turns. Shared across conversations; each turn is independent.
pub struct Agent {
    engine: DecisionEngine,
    dispatcher: Dispatcher,
    budget: ContextBudget,
    settings: AgentSettings,
}

impl Agent {
    pub fn new(
        model: Arc<dyn ChatModel>,
        dispatcher: Dispatcher,
        budget: ContextBudget,
        settings: AgentSettings,
    ) -> Self {
        Self {
            engine: DecisionEngine::new(model, settings.max_repair_attempts),
            dispatcher,
            budget,
            settings,
        }
    }

    /// Wire an agent from configuration around an already discovered pool.
    pub fn from_config(
        config: &AppConfig,
        model: Arc<dyn ChatModel>,
        pool: Arc<ProviderPool>,
        registry: Arc<ToolRegistry>,
    ) -> Self {
        let dispatcher = Dispatcher::new(
            pool,
            registry,
            ToolPolicy::from_rules(&config.tool_policy),
            config.tool_timeouts.clone(),
        );
        Self::new(
            model,
            dispatcher,
            ContextBudget::from_config(&config.model, &config.budget),
            AgentSettings::from(&config.agent),
        )
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Run one turn to a terminal state.
    ///
    /// Appends the user message, the folded tool calls and the final answer
    /// to `conversation`. Only an unreachable model is an `Err`.
    pub async fn run_turn(
        &self,
        conversation: &mut Conversation,
        user_message: &str,
        grounding: &[RetrievalChunk],
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        let started = Instant::now();
        let deadline = started + self.settings.turn_timeout;

        let mut attachments: Vec<String> = grounding.iter().map(|c| c.source.clone()).collect();
        attachments.dedup();
        conversation
            .messages
            .push(Message::user(user_message).with_attachments(attachments));

        let registry = self.dispatcher.registry();
        let system_prompt = build_system_prompt(registry, self.settings.system_prompt.as_deref());
        let grounding_section = build_grounding_section(grounding);
        let head = prompt_head(&system_prompt, grounding_section.as_deref());
        let schema = DecisionSchema::build(registry, self.settings.enforce_tool_enum);
        let reserve = self
            .budget
            .reserve(estimate_chat_tokens(std::slice::from_ref(&head)));

        tracing::info!(
            conversation = %conversation.id,
            tools = registry.len(),
            grounding_chunks = grounding.len(),
            history = conversation.len(),
            "turn started"
        );

        let mut trace = StateTrace::new(&conversation.id);
        let mut transcript: Vec<TranscriptEntry> = Vec::new();
        let mut signatures: Vec<(String, String)> = Vec::new();
        let mut iterations: u32 = 0;
        let mut tool_calls: u32 = 0;
        let mut model_calls: u32 = 0;

        let terminal = loop {
            // ── AwaitingDecision ─────────────────────────────────────────
            trace.enter(LoopState::AwaitingDecision);
            if cancel.is_cancelled() {
                break Terminal::Cancelled;
            }
            if Instant::now() >= deadline {
                break Terminal::Aborted(AbortReason::TimeBudget);
            }

            let history = trim(&conversation.messages, reserve, self.budget.limit());
            let prompt = assemble(&head, &history);
            iterations += 1;

            let decided = match bounded(self.engine.decide(&prompt, &schema), &cancel, deadline).await
            {
                Bounded::Ready(result) => result?,
                Bounded::Cancelled => break Terminal::Cancelled,
                Bounded::OutOfTime => break Terminal::Aborted(AbortReason::TimeBudget),
            };
            model_calls += decided.attempts;

            let call = match &decided.decision {
                Decision::Respond { final_text } => {
                    conversation.messages.push(Message::assistant(final_text.clone()));
                    break Terminal::Completed(final_text.clone());
                }
                Decision::ToolCall(call) => call,
            };

            tool_calls += 1;
            if tool_calls > self.settings.max_iterations {
                tracing::warn!(
                    conversation = %conversation.id,
                    cap = self.settings.max_iterations,
                    tool = %call.tool_name,
                    "tool-call cap reached"
                );
                break Terminal::Aborted(AbortReason::IterationCap);
            }

            // ── Executing ────────────────────────────────────────────────
            trace.enter(LoopState::Executing);
            signatures.push(signature(call));
            let repeats = consecutive_duplicate_count(&signatures);

            let result = if repeats > self.settings.max_duplicate_calls {
                tracing::warn!(
                    conversation = %conversation.id,
                    tool = %call.tool_name,
                    duplicate_count = repeats,
                    "duplicate tool call refused"
                );
                let refused = duplicate_result(call, repeats);
                transcript.push(transcript_entry(call, &refused));
                refused
            } else {
                // The dispatcher watches `cancel` itself so a cancelled call
                // still lands in the transcript.
                match tokio::time::timeout_at(
                    deadline,
                    self.dispatcher.dispatch(call, &mut transcript, &cancel),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => break Terminal::Aborted(AbortReason::TimeBudget),
                }
            };

            if cancel.is_cancelled() {
                break Terminal::Cancelled;
            }

            // ── FoldResult ───────────────────────────────────────────────
            trace.enter(LoopState::FoldResult);
            conversation.messages.push(decision_message(&decided.decision));
            conversation
                .messages
                .push(fold_tool_result(&result, self.settings.max_tool_result_chars));
        };

        let (final_text, state) = match terminal {
            Terminal::Completed(text) => {
                trace.enter(LoopState::Done);
                (text, TerminalState::Completed)
            }
            Terminal::Cancelled => {
                trace.enter(LoopState::Cancelled);
                let text = best_effort_answer("the request was cancelled", &transcript);
                (text, TerminalState::Cancelled)
            }
            Terminal::Aborted(reason) => {
                trace.enter(LoopState::Aborted);
                let why = match reason {
                    AbortReason::IterationCap => format!(
                        "I reached the limit of {} tool calls for one request",
                        self.settings.max_iterations
                    ),
                    AbortReason::TimeBudget => format!(
                        "I ran out of time ({:?} budget for one request)",
                        self.settings.turn_timeout
                    ),
                };
                let text = best_effort_answer(&why, &transcript);
                conversation.messages.push(Message::assistant(text.clone()));
                (text, TerminalState::Aborted(reason))
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            conversation = %conversation.id,
            state = ?state,
            iterations,
            tool_calls = transcript.len(),
            model_calls,
            elapsed_ms,
            "turn finished"
        );

        Ok(TurnOutcome {
            final_text,
            transcript,
            state,
            iterations,
            model_calls,
            state_trace: trace.into_states(),
            elapsed_ms,
        })
    }

    /// Run a turn in the background.
    ///
    /// The conversation moves into the task and comes back in
    /// [`FinishedTurn`], whatever the result.
    pub fn spawn_turn(
        self: &Arc<Self>,
        conversation: Conversation,
        user_message: String,
        grounding: Vec<RetrievalChunk>,
    ) -> TurnHandle {
        let cancel = CancellationToken::new();
        let agent = Arc::clone(self);
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut conversation = conversation;
            let result = agent
                .run_turn(&mut conversation, &user_message, &grounding, token)
                .await;
            FinishedTurn {
                conversation,
                result,
            }
        });
        TurnHandle { cancel, task }
    }
}

// ─── TurnHandle ─────────────────────────────────────────────────────────────

/// A finished background turn.
#[derive(Debug)]
pub struct FinishedTurn {
    pub conversation: Conversation,
    pub result: Result<TurnOutcome, AgentError>,
}

/// Cancellable, awaitable handle to a background turn.
pub struct TurnHandle {
    cancel: CancellationToken,
    task: JoinHandle<FinishedTurn>,
}

impl TurnHandle {
    /// Request cancellation. The turn stops at its next suspension point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the turn to finish.
    pub async fn wait(self) -> Result<FinishedTurn, AgentError> {
        self.task.await.map_err(|e| AgentError::TaskFailed {
            reason: e.to_string(),
        })
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

struct StateTrace {
    conversation: String,
    states: Vec<LoopState>,
}

impl StateTrace {
    fn new(conversation: &str) -> Self {
        Self {
            conversation: conversation.to_string(),
            states: Vec::new(),
        }
    }

    fn enter(&mut self, next: LoopState) {
        tracing::info!(
            conversation = %self.conversation,
            from = %self.states.last().map(|s| s.to_string()).unwrap_or_else(|| "start".into()),
            to = %next,
            "loop transition"
        );
        self.states.push(next);
    }

    fn into_states(self) -> Vec<LoopState> {
        self.states
    }
}

fn signature(call: &ToolInvocation) -> (String, String) {
    (call.tool_name.clone(), call.arguments.to_string())
}

/// How many times the last signature repeats at the end of `history`.
fn consecutive_duplicate_count(history: &[(String, String)]) -> usize {
    let Some(last) = history.last() else {
        return 0;
    };
    history.iter().rev().take_while(|entry| *entry == last).count()
}

fn duplicate_result(call: &ToolInvocation, repeats: usize) -> ToolResult {
    ToolResult::failure(
        &call.tool_name,
        ToolErrorKind::Duplicate,
        format!(
            "Not executed: this exact call to '{}' was requested {repeats} times in a row and \
             its result will not change. Use the results you already have and respond.",
            call.tool_name
        ),
        0,
    )
}

/// Compose an answer from the transcript without calling the model.
fn best_effort_answer(reason: &str, transcript: &[TranscriptEntry]) -> String {
    let successes: Vec<&TranscriptEntry> = transcript.iter().filter(|e| e.success).collect();

    let mut text = format!("{reason}, so this answer may be incomplete.");
    if successes.is_empty() {
        match transcript.last() {
            Some(last) => text.push_str(&format!(
                "\n\nNone of the {} tool calls succeeded. Last error from {}: {}",
                transcript.len(),
                last.tool_name,
                last.summarized_output
            )),
            None => text.push_str("\n\nNo tool results were collected."),
        }
        return text;
    }

    text.push_str("\n\nHere is what I found so far:");
    let skip = successes.len().saturating_sub(BEST_EFFORT_MAX_RESULTS);
    for entry in successes.iter().skip(skip) {
        text.push_str(&format!("\n- {}: {}", entry.tool_name, entry.summarized_output));
    }
    text
}

// ─── Tests ──────────────────────────────────────────────────────────────────
