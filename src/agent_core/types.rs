//! Shared types for the agent core.
//!
//! Conversation messages, decisions, tool results and transcript entries
//! used across the budgeter, decision engine, dispatcher and loop.

use serde::{Deserialize, Serialize};

pub use crate::inference::types::Role;

// ─── Conversation Messages ──────────────────────────────────────────────────

/// A single message in conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// On an assistant message: the tool it invoked. On a tool message: the
    /// tool whose result it carries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// On a tool message: whether the call succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_success: Option<bool>,
    /// References to attached documents.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    /// Set when the budgeter shortened the content.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}

impl Message {
    fn new(role: Role, content: impl Into<String>, tool_name: Option<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_name,
            tool_success: None,
            attachments: Vec::new(),
            truncated: false,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content, None)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content, None)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content, None)
    }

    /// Assistant message recording a tool invocation.
    pub fn tool_call(tool_name: &str, content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content, Some(tool_name.to_string()))
    }

    /// Tool-role message carrying a folded result.
    pub fn tool_result(tool_name: &str, success: bool, content: impl Into<String>) -> Self {
        let mut message = Self::new(Role::Tool, content, Some(tool_name.to_string()));
        message.tool_success = Some(success);
        message
    }

    pub fn with_attachments(mut self, attachments: Vec<String>) -> Self {
        self.attachments = attachments;
        self
    }

    /// Whether this is the assistant half of a tool call/result pair.
    pub fn is_tool_call(&self) -> bool {
        self.role == Role::Assistant && self.tool_name.is_some()
    }
}

/// Ordered message history of one conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            messages: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Decisions ──────────────────────────────────────────────────────────────

/// A validated request to run one tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool_name: String,
    /// Always a JSON object.
    pub arguments: serde_json::Value,
}

/// The structured output of one reasoning step.
///
/// The wire shape (flat object with optional fields) lives in
/// [`crate::agent_core::decision::WireDecision`].
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Respond { final_text: String },
    ToolCall(ToolInvocation),
}

// ─── Tool Results ───────────────────────────────────────────────────────────

/// Why a tool invocation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    UnknownTool,
    InvalidArguments,
    Timeout,
    ProviderUnavailable,
    ProviderError,
    PermissionDenied,
    Duplicate,
    Cancelled,
}

impl std::fmt::Display for ToolErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ToolErrorKind::UnknownTool => "unknown_tool",
            ToolErrorKind::InvalidArguments => "invalid_arguments",
            ToolErrorKind::Timeout => "timeout",
            ToolErrorKind::ProviderUnavailable => "provider_unavailable",
            ToolErrorKind::ProviderError => "provider_error",
            ToolErrorKind::PermissionDenied => "permission_denied",
            ToolErrorKind::Duplicate => "duplicate",
            ToolErrorKind::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// Normalized outcome of one dispatch. Failures are values, never `Err`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_name: String,
    pub success: bool,
    /// Payload text on success, error text on failure.
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ToolErrorKind>,
    pub latency_ms: u64,
}

impl ToolResult {
    pub fn success(tool_name: &str, output: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            success: true,
            output: output.into(),
            error_kind: None,
            latency_ms,
        }
    }

    pub fn failure(
        tool_name: &str,
        kind: ToolErrorKind,
        output: impl Into<String>,
        latency_ms: u64,
    ) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            success: false,
            output: output.into(),
            error_kind: Some(kind),
            latency_ms,
        }
    }
}

// ─── Transcript ─────────────────────────────────────────────────────────────

/// One dispatched tool call, as shown to the user and kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ToolErrorKind>,
    /// One-line preview of the output.
    pub summarized_output: String,
    /// Full, untruncated output.
    pub display_output: String,
    pub latency_ms: u64,
    /// RFC 3339 timestamp of the dispatch.
    pub timestamp: String,
}

// ─── Tests ──────────────────────────────────────────────────────────────────
