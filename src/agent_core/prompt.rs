//! Prompt assembly.
//!
//! The prompt for each decision has three parts:
//! 1. System prompt: intro, tool catalogue from the live registry, the reply
//!    format and rules, and examples.
//! 2. Grounding: excerpts of the attached document, with line ranges.
//! 3. History, already trimmed by the budgeter.
//!
//! Tool results are sent as user messages; the chat template of most local
//! models has no tool role.

use crate::inference::types::{ChatMessage, Role as ChatRole};
use crate::mcp_client::ToolRegistry;
use crate::retrieval::RetrievalChunk;

use super::decision::{Action, WireDecision};
use super::types::{Message, Role};

/// Identity and intro: static portion of the system prompt.
const SYSTEM_PROMPT_INTRO: &str = "\
You are a local assistant running on the user's machine. You answer the user's \
request directly, and call tools when the answer needs live data or an action \
you cannot perform yourself.";

const REPLY_FORMAT: &str = "\
# Reply format

Every reply is exactly ONE JSON object and nothing else.
- To call a tool: {\"action\": \"tool_call\", \"tool_name\": \"<tool>\", \"arguments\": {...}}
- To answer the user: {\"action\": \"respond\", \"final_text\": \"<answer>\"}";

const RULES: &str = "\
Rules:
1. Use a tool only when the request needs it: news, current events, prices, \
files, commands. Answer general knowledge and conversation directly.
2. Call one tool at a time. Its result arrives in a message starting with \
[Tool: name], or [Tool: name - Failed] if it failed.
3. After a failure, read the error. Fix the tool name or arguments, try a \
different approach, or answer with what you have. NEVER repeat an identical call.
4. NEVER invent URLs, file contents or results. Only report what tools actually returned.
5. As soon as you have enough information, respond.";

// ─── System Prompt ──────────────────────────────────────────────────────────

/// Build the system prompt from the registry's current tools.
///
/// `intro` replaces the default identity paragraph when set.
pub fn build_system_prompt(registry: &ToolRegistry, intro: Option<&str>) -> String {
    let intro = intro.filter(|s| !s.trim().is_empty()).unwrap_or(SYSTEM_PROMPT_INTRO);

    if registry.is_empty() {
        return format!(
            "{intro}\n\nNo tools are available in this session.\n\n{REPLY_FORMAT}\n\n\
             Always reply with action=respond.\n\n{}",
            respond_example()
        );
    }

    format!(
        "{intro}\n\n# Tools\n\n{}\n\n**Available tools:**\n{}\n\n{REPLY_FORMAT}\n\n{RULES}\n\n{}\n\n{}",
        registry.capability_summary(),
        registry.render_catalogue(),
        tool_call_example(registry),
        respond_example()
    )
}

/// Example call of the first registered tool, with placeholder arguments
/// for its required parameters.
fn tool_call_example(registry: &ToolRegistry) -> String {
    let Some(tool) = registry.tools().next() else {
        return String::new();
    };
    let arguments: serde_json::Map<String, serde_json::Value> = tool
        .descriptor
        .required_params()
        .into_iter()
        .map(|p| (p.to_string(), serde_json::Value::String("...".to_string())))
        .collect();
    let example = WireDecision {
        action: Action::ToolCall,
        tool_name: Some(tool.descriptor.name.clone()),
        arguments: Some(serde_json::Value::Object(arguments)),
        final_text: None,
    };
    format!("**Example: calling `{}`:**\n{}", tool.descriptor.name, example.to_json())
}

fn respond_example() -> String {
    let example = WireDecision {
        action: Action::Respond,
        tool_name: None,
        arguments: None,
        final_text: Some("4".to_string()),
    };
    format!("**Example: user asks 'what is 2+2':**\n{}", example.to_json())
}

// ─── Grounding ──────────────────────────────────────────────────────────────

/// The document-context section for retrieved chunks, if any.
pub fn build_grounding_section(chunks: &[RetrievalChunk]) -> Option<String> {
    let first = chunks.first()?;

    let excerpts: Vec<String> = chunks
        .iter()
        .map(|c| format!("[{} lines {}-{}]\n{}", c.source, c.start_line, c.end_line, c.text))
        .collect();

    Some(format!(
        "The user has attached a document: \"{}\"\n\
         Below are relevant excerpts that may help answer the question.\n\n\
         --- DOCUMENT CONTEXT ---\n\n{}\n\n--- END DOCUMENT CONTEXT ---\n\n\
         Use the above context if relevant, citing line ranges. If the context doesn't \
         contain relevant information, answer based on your general knowledge.",
        first.source,
        excerpts.join("\n\n")
    ))
}

// ─── Assembly ───────────────────────────────────────────────────────────────

/// The fixed head of the prompt: system prompt plus grounding.
pub fn prompt_head(system_prompt: &str, grounding: Option<&str>) -> ChatMessage {
    match grounding {
        Some(section) => ChatMessage::system(format!("{system_prompt}\n\n{section}")),
        None => ChatMessage::system(system_prompt),
    }
}

fn to_chat_message(message: &Message) -> ChatMessage {
    let role = match message.role {
        Role::Tool => ChatRole::User,
        other => other,
    };
    ChatMessage {
        role,
        content: message.content.clone(),
    }
}

/// Full prompt: `head` followed by `history`.
pub fn assemble(head: &ChatMessage, history: &[Message]) -> Vec<ChatMessage> {
    std::iter::once(head.clone())
        .chain(history.iter().map(to_chat_message))
        .collect()
}

// ─── Tests ──────────────────────────────────────────────────────────────────
