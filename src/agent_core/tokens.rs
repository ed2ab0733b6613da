//! Token estimation for context window management.
//!
//! Uses character-based heuristics calibrated for LLM tokenizers:
//! - English prose: ~3.2 chars/token (conservative, overestimates)
//! - JSON/structured content: ~2.8 chars/token (denser due to punctuation, short keys)
//!
//! The estimate is deterministic: identical text always costs the same.

use crate::agent_core::types::{Message, Role};
use crate::inference::types::ChatMessage;

// ─── Constants ──────────────────────────────────────────────────────────────

/// Average characters per token for English prose.
///
/// Most tokenizers produce ~3.5-4.0 chars/token for English; 3.2 errs on the
/// side of overestimation so the context window never overflows.
pub(crate) const CHARS_PER_TOKEN: f64 = 3.2;

/// Average characters per token for JSON/structured content.
///
/// Tool results and decision objects fall into this category.
pub(crate) const JSON_CHARS_PER_TOKEN: f64 = 2.8;

/// Per-message overhead (role label, formatting tokens).
pub(crate) const MESSAGE_OVERHEAD_TOKENS: u32 = 4;

// ─── UTF-8 Safe Truncation ──────────────────────────────────────────────────

/// Truncate a string to at most `max_bytes` bytes on a valid UTF-8 char boundary.
///
/// If the byte at `max_bytes` is inside a multi-byte character, the slice is
/// shortened to the preceding character boundary.
pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ─── Public API ─────────────────────────────────────────────────────────────

/// Estimate the token count for a string of natural language text.
pub fn estimate_tokens(text: &str) -> u32 {
    let chars = text.len() as f64;
    (chars / CHARS_PER_TOKEN).ceil() as u32
}

/// Estimate the token count for JSON/structured content.
pub fn estimate_json_tokens(json_text: &str) -> u32 {
    let chars = json_text.len() as f64;
    (chars / JSON_CHARS_PER_TOKEN).ceil() as u32
}

/// Characters per token used for a message's content.
pub(crate) fn chars_per_token(role: Role) -> f64 {
    match role {
        Role::Tool => JSON_CHARS_PER_TOKEN,
        _ => CHARS_PER_TOKEN,
    }
}

/// Estimate the content tokens of a message, by role.
pub fn estimate_content_tokens(role: Role, content: &str) -> u32 {
    match role {
        Role::Tool => estimate_json_tokens(content),
        _ => estimate_tokens(content),
    }
}

/// Tokens a message costs regardless of its content.
pub(crate) fn fixed_message_tokens(message: &Message) -> u32 {
    MESSAGE_OVERHEAD_TOKENS + message.tool_name.as_deref().map(estimate_tokens).unwrap_or(0)
}

/// Estimate the token count for a conversation `Message`.
///
/// Tool results use the JSON estimator; everything else the prose one.
pub fn estimate_message_tokens(message: &Message) -> u32 {
    fixed_message_tokens(message) + estimate_content_tokens(message.role, &message.content)
}

/// Estimate the total for a slice of messages.
pub fn estimate_messages_tokens(messages: &[Message]) -> u32 {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Estimate the token count for an outbound `ChatMessage`.
pub fn estimate_chat_tokens(messages: &[ChatMessage]) -> u32 {
    messages
        .iter()
        .map(|m| MESSAGE_OVERHEAD_TOKENS + estimate_tokens(&m.content))
        .sum()
}

// ─── Tests ──────────────────────────────────────────────────────────────────
