//! Folding decisions and tool results back into the conversation.
//!
//! Tool results enter history as role=tool messages rendered
//! `[Tool: name]\n<output>` or `[Tool: name - Failed]\n<output>`, capped at a
//! configured number of chars.

use super::decision::WireDecision;
use super::types::{Decision, Message, Role, ToolInvocation, ToolResult, TranscriptEntry};

/// Longest `summarized_output` kept in a transcript entry.
const SUMMARY_CHARS: usize = 200;

// ─── Rendering ──────────────────────────────────────────────────────────────

/// The first `max_chars` characters of `text`.
fn head_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

/// Cap a tool's output at `max_chars` characters, keeping the head.
pub fn truncate_tool_output(output: &str, max_chars: usize, tool_name: &str) -> String {
    let total = output.chars().count();
    if total <= max_chars {
        return output.to_string();
    }

    let kept = head_chars(output, max_chars);
    tracing::warn!(
        tool = %tool_name,
        original_chars = total,
        truncated_to = max_chars,
        "tool result truncated"
    );
    format!("{kept}\n\n[... truncated: showing first {max_chars} of {total} chars]")
}

fn header(tool_name: &str, success: bool) -> String {
    if success {
        format!("[Tool: {tool_name}]")
    } else {
        format!("[Tool: {tool_name} - Failed]")
    }
}

/// The role=tool message for a result.
pub fn fold_tool_result(result: &ToolResult, max_chars: usize) -> Message {
    let body = truncate_tool_output(&result.output, max_chars, &result.tool_name);
    let content = format!("{}\n{body}", header(&result.tool_name, result.success));
    Message::tool_result(&result.tool_name, result.success, content)
}

/// `(tool_name, success)` of a folded tool message.
///
/// Read from the message fields; the rendered header is for the model only.
pub fn parse_tool_message(message: &Message) -> Option<(String, bool)> {
    if message.role != Role::Tool {
        return None;
    }
    Some((message.tool_name.clone()?, message.tool_success?))
}

/// The history message recording a decision.
///
/// A tool call is stored as its wire JSON so the model sees its own
/// decisions in the shape it must produce; an answer is stored as plain text.
pub fn decision_message(decision: &Decision) -> Message {
    match decision {
        Decision::Respond { final_text } => Message::assistant(final_text.clone()),
        Decision::ToolCall(call) => {
            Message::tool_call(&call.tool_name, WireDecision::from(decision).to_json())
        }
    }
}

// ─── Transcript ─────────────────────────────────────────────────────────────

/// First line of `text`, shortened to a preview.
pub fn summarize_output(text: &str) -> String {
    let first_line = text.lines().find(|l| !l.trim().is_empty()).unwrap_or("").trim();
    let summary = if first_line.chars().count() <= SUMMARY_CHARS {
        first_line.to_string()
    } else {
        format!("{}...", head_chars(first_line, SUMMARY_CHARS))
    };
    if first_line.len() < text.trim().len() {
        format!("{summary} ({} chars total)", text.chars().count())
    } else {
        summary
    }
}

pub fn transcript_entry(call: &ToolInvocation, result: &ToolResult) -> TranscriptEntry {
    TranscriptEntry {
        tool_name: call.tool_name.clone(),
        arguments: call.arguments.clone(),
        success: result.success,
        error_kind: result.error_kind,
        summarized_output: summarize_output(&result.output),
        display_output: result.output.clone(),
        latency_ms: result.latency_ms,
        timestamp: chrono::Utc::now().to_rfc3339(),
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
