//! Agent Core: the per-turn tool-use loop.
//!
//! Submodules:
//! - `orchestrator`: the loop state machine and turn handles
//! - `decision`: decision schema, local validation and repair
//! - `tool_router`: dispatches tool calls to providers
//! - `budget`: trims history to the context window
//! - `fold`: tool results as conversation messages and transcript entries
//! - `prompt`: system prompt, grounding section and prompt assembly
//! - `policy`: per-tool allow/deny rules
//! - `schema`: JSON-Schema subset validator and constrained choices
//! - `tokens`: token estimation
//! - `types`: shared types
//! - `errors`: agent-level error types

pub mod budget;
pub mod decision;
pub mod errors;
pub mod fold;
pub mod orchestrator;
pub mod policy;
pub mod prompt;
pub mod schema;
pub mod tokens;
pub mod tool_router;
pub mod types;

pub use budget::{trim, ContextBudget};
pub use decision::{Decided, DecisionEngine, DecisionSchema, WireDecision};
pub use errors::AgentError;
pub use orchestrator::{
    AbortReason, Agent, AgentSettings, FinishedTurn, LoopState, TerminalState, TurnHandle,
    TurnOutcome,
};
pub use policy::{ToolPermission, ToolPolicy};
pub use tool_router::Dispatcher;
pub use types::{
    Conversation, Decision, Message, Role, ToolErrorKind, ToolInvocation, ToolResult,
    TranscriptEntry,
};
