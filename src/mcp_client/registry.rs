//! Tool registry: aggregates tool descriptors across all providers.
//!
//! Provides:
//! - Lookup of a tool's owning provider and parameter schema
//! - The sorted live tool-name list (the decision schema's dynamic enum)
//! - "Did you mean" suggestions for misspelled names
//! - A rendered tool catalogue for the system prompt

use std::collections::BTreeMap;

use super::types::{ToolClass, ToolDescriptor};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Suggestions scoring below this similarity are not offered.
const SUGGESTION_FLOOR: f64 = 0.3;

// ─── ToolRegistry ────────────────────────────────────────────────────────────

/// A tool together with the provider that serves it.
#[derive(Debug, Clone)]
pub struct RegisteredTool {
    pub provider: String,
    pub descriptor: ToolDescriptor,
    pub class: ToolClass,
}

/// Aggregated tool registry across all providers.
///
/// Tool names are unique across the registry. Iteration order is the sorted
/// tool name, so everything derived from the registry is deterministic.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, RegisteredTool>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the tools one provider advertised at handshake.
    ///
    /// A name already owned by another provider is rejected. Returns the
    /// rejected names.
    pub fn register_provider_tools(
        &mut self,
        provider: &str,
        tools: Vec<ToolDescriptor>,
        class: ToolClass,
    ) -> Vec<String> {
        let mut rejected = Vec::new();
        for descriptor in tools {
            if let Some(existing) = self.tools.get(&descriptor.name) {
                if existing.provider != provider {
                    tracing::warn!(
                        tool = %descriptor.name,
                        provider,
                        owner = %existing.provider,
                        "duplicate tool name rejected"
                    );
                    rejected.push(descriptor.name);
                    continue;
                }
            }
            self.tools.insert(
                descriptor.name.clone(),
                RegisteredTool {
                    provider: provider.to_string(),
                    descriptor,
                    class,
                },
            );
        }
        rejected
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    /// All registered tools in name order.
    pub fn tools(&self) -> impl Iterator<Item = &RegisteredTool> {
        self.tools.values()
    }

    /// Sorted tool names.
    pub fn tool_names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Sorted unique provider names.
    pub fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.values().map(|t| t.provider.clone()).collect();
        names.sort();
        names.dedup();
        names
    }

    /// Find up to `max_results` registered names most similar to `name`.
    pub fn find_similar(&self, name: &str, max_results: usize) -> Vec<String> {
        let mut scored: Vec<(&String, f64)> = self
            .tools
            .keys()
            .map(|candidate| (candidate, similarity(name, candidate)))
            .filter(|(_, score)| *score >= SUGGESTION_FLOOR)
            .collect();

        // Stable sort keeps name order among equal scores.
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(max_results);
        scored.into_iter().map(|(name, _)| name.clone()).collect()
    }

    /// Render the tool catalogue for the system prompt.
    ///
    /// One line per tool: `- name(param: type, optional?: type): description`.
    pub fn render_catalogue(&self) -> String {
        if self.is_empty() {
            return "No tools are currently available.".to_string();
        }

        self.tools
            .values()
            .map(|t| {
                let required = t.descriptor.required_params();
                let params: Vec<String> = t
                    .descriptor
                    .input_schema
                    .get("properties")
                    .and_then(|p| p.as_object())
                    .map(|props| {
                        props
                            .iter()
                            .map(|(name, schema)| {
                                let ty = schema
                                    .get("type")
                                    .map(|v| match v {
                                        serde_json::Value::String(s) => s.clone(),
                                        other => other.to_string(),
                                    })
                                    .unwrap_or_else(|| "any".to_string());
                                let marker = if required.contains(&name.as_str()) { "" } else { "?" };
                                format!("{name}{marker}: {ty}")
                            })
                            .collect()
                    })
                    .unwrap_or_default();

                let description = if t.descriptor.description.is_empty() {
                    "(no description)"
                } else {
                    t.descriptor.description.as_str()
                };
                format!("- {}({}): {description}", t.descriptor.name, params.join(", "))
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// One-line summary: tool count and per-provider breakdown.
    pub fn capability_summary(&self) -> String {
        if self.is_empty() {
            return "No tools available.".to_string();
        }
        let providers = self.provider_names();
        let parts: Vec<String> = providers
            .iter()
            .map(|p| {
                let count = self.tools.values().filter(|t| &t.provider == p).count();
                format!("{p} ({count})")
            })
            .collect();
        format!(
            "{} tools across {} providers: {}.",
            self.len(),
            providers.len(),
            parts.join(", ")
        )
    }
}

// ─── Edit Distance ──────────────────────────────────────────────────────────

/// Levenshtein edit distance over chars.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let n = b.len();

    let mut prev: Vec<usize> = (0..=n).collect();
    let mut curr = vec![0usize; n + 1];

    for i in 1..=a.len() {
        curr[0] = i;
        for j in 1..=n {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[n]
}

/// Normalized similarity (0.0 = completely different, 1.0 = identical).
fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - (levenshtein(a, b) as f64 / max_len as f64)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
