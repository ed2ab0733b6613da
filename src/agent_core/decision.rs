//! Decision engine: turns a prompt into exactly one well-formed [`Decision`].
//!
//! The model is asked for a JSON object constrained by a schema built per
//! request from the live tool registry:
//!
//! ```text
//! {"action": "tool_call", "tool_name": <enum of tool names>, "arguments": {...}}
//! {"action": "respond", "final_text": "..."}
//! ```
//!
//! Output that fails validation is re-prompted with the violation as
//! feedback, up to `max_repair_attempts` times. After that a `respond`
//! decision explaining the failure is synthesized, so the loop always
//! receives a valid decision.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::errors::AgentError;
use super::schema::{self, ChoiceViolation, ConstrainedChoice, SchemaViolation};
use super::types::{Decision, ToolInvocation};
use crate::inference::{ChatMessage, ChatModel, InferenceError};
use crate::mcp_client::ToolRegistry;

// ─── Wire Format ─────────────────────────────────────────────────────────────

/// The decision's `action` discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Respond,
    ToolCall,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Respond => f.write_str("respond"),
            Action::ToolCall => f.write_str("tool_call"),
        }
    }
}

/// Flat wire representation of a decision. Only the fields for its action
/// are populated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireDecision {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_text: Option<String>,
}

impl From<&Decision> for WireDecision {
    fn from(decision: &Decision) -> Self {
        match decision {
            Decision::Respond { final_text } => Self {
                action: Action::Respond,
                tool_name: None,
                arguments: None,
                final_text: Some(final_text.clone()),
            },
            Decision::ToolCall(call) => Self {
                action: Action::ToolCall,
                tool_name: Some(call.tool_name.clone()),
                arguments: Some(call.arguments.clone()),
                final_text: None,
            },
        }
    }
}

impl WireDecision {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ─── Violations ──────────────────────────────────────────────────────────────

/// Why raw model output was not accepted as a decision.
#[derive(Debug, Clone, PartialEq)]
pub enum DecisionViolation {
    NotJson { reason: String },
    Field(SchemaViolation),
    Choice { field: &'static str, violation: ChoiceViolation },
}

impl fmt::Display for DecisionViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecisionViolation::NotJson { reason } => {
                write!(f, "output is not a single JSON object ({reason})")
            }
            DecisionViolation::Field(v) => write!(f, "{v}"),
            DecisionViolation::Choice { field, violation } => write!(f, "`{field}`: {violation}"),
        }
    }
}

fn field_error(path: &str, message: impl Into<String>) -> DecisionViolation {
    DecisionViolation::Field(SchemaViolation::new(path, message))
}

// ─── Schema ──────────────────────────────────────────────────────────────────

const FIELDS: [&str; 4] = ["action", "tool_name", "arguments", "final_text"];

/// The decision schema for one request, parameterized by the live tool set.
#[derive(Debug, Clone)]
pub struct DecisionSchema {
    actions: ConstrainedChoice<Action>,
    tool_names: ConstrainedChoice<String>,
    tool_params: BTreeMap<String, Value>,
    /// Check tool membership and argument shape locally too.
    enforce_tool_enum: bool,
}

impl DecisionSchema {
    /// Build from the registry's current tools.
    pub fn build(registry: &ToolRegistry, enforce_tool_enum: bool) -> Self {
        let tool_params: BTreeMap<String, Value> = registry
            .tools()
            .map(|t| (t.descriptor.name.clone(), t.descriptor.input_schema.clone()))
            .collect();
        let actions = if tool_params.is_empty() {
            ConstrainedChoice::new([Action::Respond])
        } else {
            ConstrainedChoice::new([Action::ToolCall, Action::Respond])
        };
        Self {
            actions,
            tool_names: ConstrainedChoice::new(tool_params.keys().cloned()),
            tool_params,
            enforce_tool_enum,
        }
    }

    pub fn tool_names(&self) -> &[String] {
        self.tool_names.choices()
    }

    /// JSON-Schema handed to the model as its output constraint.
    pub fn to_json_schema(&self) -> Value {
        let respond = serde_json::json!({
            "type": "object",
            "properties": {
                "action": {"type": "string", "enum": ["respond"]},
                "final_text": {"type": "string", "minLength": 1}
            },
            "required": ["action", "final_text"],
            "additionalProperties": false
        });

        if self.tool_names.is_empty() {
            return serde_json::json!({"oneOf": [respond]});
        }

        let per_tool: Vec<Value> = self
            .tool_params
            .iter()
            .map(|(name, params)| {
                serde_json::json!({
                    "if": {"properties": {"tool_name": {"const": name}}},
                    "then": {"properties": {"arguments": params}}
                })
            })
            .collect();

        let tool_call = serde_json::json!({
            "type": "object",
            "properties": {
                "action": {"type": "string", "enum": ["tool_call"]},
                "tool_name": self.tool_names.to_schema(),
                "arguments": {"type": "object"}
            },
            "required": ["action", "tool_name", "arguments"],
            "additionalProperties": false,
            "allOf": per_tool
        });

        serde_json::json!({"oneOf": [tool_call, respond]})
    }

    /// Parse and validate raw model output.
    ///
    /// Tolerates `<think>` blocks and markdown fences around the object.
    /// Null fields count as absent.
    pub fn parse(&self, raw: &str) -> Result<Decision, DecisionViolation> {
        let cleaned = strip_think_tags(raw);
        let candidate = extract_json_object(&cleaned).ok_or_else(|| DecisionViolation::NotJson {
            reason: "no JSON object found".to_string(),
        })?;
        let value: Value =
            serde_json::from_str(candidate).map_err(|e| DecisionViolation::NotJson {
                reason: e.to_string(),
            })?;
        let Some(obj) = value.as_object() else {
            return Err(DecisionViolation::NotJson {
                reason: "top-level value is not an object".to_string(),
            });
        };

        let field = |name: &str| obj.get(name).filter(|v| !v.is_null());

        if let Some(extra) = obj
            .iter()
            .find(|(k, v)| !v.is_null() && !FIELDS.contains(&k.as_str()))
        {
            return Err(field_error("", format!("unexpected field `{}`", extra.0)));
        }

        let action_name = field("action")
            .and_then(|a| a.as_str())
            .ok_or_else(|| field_error("", "missing required field `action`"))?;
        let action_labels = ConstrainedChoice::new(self.actions.choices().iter().map(|a| a.to_string()));
        action_labels
            .check(action_name)
            .map_err(|violation| DecisionViolation::Choice {
                field: "action",
                violation,
            })?;

        if action_name == "respond" {
            for forbidden in ["tool_name", "arguments"] {
                if field(forbidden).is_some() {
                    return Err(field_error(
                        "",
                        format!("`{forbidden}` is not allowed when action is respond"),
                    ));
                }
            }
            let text = field("final_text")
                .ok_or_else(|| field_error("", "missing required field `final_text`"))?
                .as_str()
                .ok_or_else(|| field_error("final_text", "expected string"))?;
            if text.trim().is_empty() {
                return Err(field_error("final_text", "must not be empty"));
            }
            return Ok(Decision::Respond {
                final_text: text.to_string(),
            });
        }

        if field("final_text").is_some() {
            return Err(field_error(
                "",
                "`final_text` is not allowed when action is tool_call",
            ));
        }
        let tool_name = field("tool_name")
            .ok_or_else(|| field_error("", "missing required field `tool_name`"))?
            .as_str()
            .ok_or_else(|| field_error("tool_name", "expected string"))?
            .trim();
        if tool_name.is_empty() {
            return Err(field_error("tool_name", "must not be empty"));
        }
        let arguments = field("arguments")
            .ok_or_else(|| field_error("", "missing required field `arguments`"))?;
        if !arguments.is_object() {
            return Err(field_error(
                "arguments",
                format!("expected object, got {}", schema::json_type_name(arguments)),
            ));
        }

        if self.enforce_tool_enum {
            self.tool_names
                .check(tool_name)
                .map_err(|violation| DecisionViolation::Choice {
                    field: "tool_name",
                    violation,
                })?;
            if let Some(params) = self.tool_params.get(tool_name) {
                schema::validate(arguments, params).map_err(|v| {
                    let path = if v.path.is_empty() {
                        "arguments".to_string()
                    } else {
                        format!("arguments.{}", v.path)
                    };
                    DecisionViolation::Field(SchemaViolation::new(&path, v.message))
                })?;
            }
        }

        Ok(Decision::ToolCall(ToolInvocation {
            tool_name: tool_name.to_string(),
            arguments: arguments.clone(),
        }))
    }

    /// Corrective message appended after an invalid reply.
    fn repair_feedback(&self, violation: &DecisionViolation) -> String {
        let tools = if self.tool_names.is_empty() {
            "No tools are available; you must respond.".to_string()
        } else {
            format!("Valid tool names: {}.", self.tool_names.choices().join(", "))
        };
        format!(
            "Your previous reply was not a valid decision: {violation}.\n\
             Reply with exactly one JSON object and nothing else, either\n\
             {{\"action\": \"tool_call\", \"tool_name\": \"<tool>\", \"arguments\": {{...}}}}\n\
             or\n\
             {{\"action\": \"respond\", \"final_text\": \"<answer>\"}}\n\
             {tools}"
        )
    }
}

/// Remove `<think>...</think>` blocks emitted by reasoning models.
///
/// An unclosed `<think>` drops the rest of the text; a stray `</think>`
/// drops everything before it.
pub fn strip_think_tags(text: &str) -> String {
    const OPEN: &str = "<think>";
    const CLOSE: &str = "</think>";

    let lower = text.to_ascii_lowercase();
    let mut out = String::with_capacity(text.len());
    let mut pos = 0;

    // Some templates open the block in the prompt, so only the close appears.
    if let Some(close) = lower.find(CLOSE) {
        if !lower[..close].contains(OPEN) {
            pos = close + CLOSE.len();
        }
    }

    while let Some(rel) = lower[pos..].find(OPEN) {
        let start = pos + rel;
        out.push_str(&text[pos..start]);
        match lower[start..].find(CLOSE) {
            Some(rel_end) => pos = start + rel_end + CLOSE.len(),
            None => {
                pos = text.len();
                break;
            }
        }
    }
    out.push_str(&text[pos..]);
    out.trim().to_string()
}

/// The outermost `{...}` span, which also strips markdown code fences.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (start < end).then(|| &text[start..=end])
}

// ─── DecisionEngine ──────────────────────────────────────────────────────────

/// A decision and how it was reached.
#[derive(Debug, Clone, PartialEq)]
pub struct Decided {
    pub decision: Decision,
    /// Model calls made, including repairs.
    pub attempts: u32,
    /// The decision was synthesized after repairs ran out.
    pub fallback: bool,
}

/// Drives the model to a schema-valid decision.
pub struct DecisionEngine {
    model: Arc<dyn ChatModel>,
    max_repair_attempts: u32,
}

impl DecisionEngine {
    pub fn new(model: Arc<dyn ChatModel>, max_repair_attempts: u32) -> Self {
        Self {
            model,
            max_repair_attempts,
        }
    }

    /// Ask the model for one decision.
    ///
    /// Only an unreachable model is an error; invalid or empty output always
    /// resolves to a decision within `1 + max_repair_attempts` model calls.
    pub async fn decide(
        &self,
        prompt: &[ChatMessage],
        schema: &DecisionSchema,
    ) -> Result<Decided, AgentError> {
        let json_schema = schema.to_json_schema();
        let mut messages = prompt.to_vec();
        let mut last_violation: Option<DecisionViolation> = None;
        let max_attempts = self.max_repair_attempts + 1;

        for attempt in 1..=max_attempts {
            // A server that answered without content gets another attempt;
            // only transport and HTTP failures are fatal.
            let raw = match self.model.complete(&messages, Some(&json_schema)).await {
                Ok(raw) => raw,
                Err(InferenceError::EmptyResponse { reason }) => {
                    tracing::warn!(attempt, max_attempts, reason = %reason, "model returned no content");
                    let violation = DecisionViolation::NotJson { reason };
                    messages.push(ChatMessage::user(schema.repair_feedback(&violation)));
                    last_violation = Some(violation);
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            match schema.parse(&raw) {
                Ok(decision) => {
                    if attempt > 1 {
                        tracing::info!(attempt, "decision repaired");
                    }
                    return Ok(Decided {
                        decision,
                        attempts: attempt,
                        fallback: false,
                    });
                }
                Err(violation) => {
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        violation = %violation,
                        "model output failed decision validation"
                    );
                    messages.push(ChatMessage::assistant(raw));
                    messages.push(ChatMessage::user(schema.repair_feedback(&violation)));
                    last_violation = Some(violation);
                }
            }
        }

        let reason = last_violation
            .map(|v| v.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        tracing::error!(attempts = max_attempts, reason = %reason, "decision repair exhausted");

        Ok(Decided {
            decision: Decision::Respond {
                final_text: format!(
                    "I couldn't produce a well-formed answer: the model's output failed \
                     validation {max_attempts} times (last error: {reason}). \
                     Please try rephrasing your request."
                ),
            },
            attempts: max_attempts,
            fallback: true,
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
