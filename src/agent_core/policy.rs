//! Tool policy: which tools the dispatcher may run.
//!
//! Rules come from the `tool_policy` config section. A rule key is either an
//! exact tool name or a prefix pattern ending in `*` (`shell_*`). Exact rules
//! win over patterns, longer patterns over shorter ones, and session overrides
//! over everything. Tools without a rule are allowed.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ─── Types ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolPermission {
    Allow,
    Deny,
}

// ─── ToolPolicy ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct ToolPolicy {
    exact: HashMap<String, ToolPermission>,
    /// (prefix, permission), longest prefix first.
    patterns: Vec<(String, ToolPermission)>,
    /// Overrides that live until `clear_session()`.
    session: HashMap<String, ToolPermission>,
}

impl ToolPolicy {
    /// Allow everything.
    pub fn allow_all() -> Self {
        Self::default()
    }

    pub fn from_rules(rules: &HashMap<String, ToolPermission>) -> Self {
        let mut policy = Self::default();
        for (key, permission) in rules {
            match key.strip_suffix('*') {
                Some(prefix) => policy.patterns.push((prefix.to_string(), *permission)),
                None => {
                    policy.exact.insert(key.clone(), *permission);
                }
            }
        }
        policy
            .patterns
            .sort_by(|a, b| b.0.len().cmp(&a.0.len()).then_with(|| a.0.cmp(&b.0)));
        policy
    }

    pub fn check(&self, tool_name: &str) -> ToolPermission {
        if let Some(p) = self.session.get(tool_name) {
            return *p;
        }
        if let Some(p) = self.exact.get(tool_name) {
            return *p;
        }
        self.patterns
            .iter()
            .find(|(prefix, _)| tool_name.starts_with(prefix.as_str()))
            .map(|(_, p)| *p)
            .unwrap_or(ToolPermission::Allow)
    }

    pub fn is_allowed(&self, tool_name: &str) -> bool {
        self.check(tool_name) == ToolPermission::Allow
    }

    /// Override a tool's permission for the rest of the session.
    pub fn set_for_session(&mut self, tool_name: &str, permission: ToolPermission) {
        tracing::info!(tool = %tool_name, ?permission, "session tool permission set");
        self.session.insert(tool_name.to_string(), permission);
    }

    pub fn clear_session(&mut self) {
        self.session.clear();
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(entries: &[(&str, ToolPermission)]) -> HashMap<String, ToolPermission> {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_default_allows() {
        assert!(ToolPolicy::allow_all().is_allowed("anything"));
    }

    #[test]
    fn test_exact_rule_beats_pattern() {
        let policy = ToolPolicy::from_rules(&rules(&[
            ("shell_*", ToolPermission::Deny),
            ("shell_echo", ToolPermission::Allow),
        ]));
        assert!(!policy.is_allowed("shell_exec"));
        assert!(policy.is_allowed("shell_echo"));
        assert!(policy.is_allowed("web_search"));
    }

    #[test]
    fn test_longest_pattern_wins() {
        let policy = ToolPolicy::from_rules(&rules(&[
            ("fs_*", ToolPermission::Allow),
            ("fs_delete*", ToolPermission::Deny),
        ]));
        assert!(policy.is_allowed("fs_read"));
        assert!(!policy.is_allowed("fs_delete_file"));
    }

    #[test]
    fn test_session_override_and_clear() {
        let mut policy = ToolPolicy::from_rules(&rules(&[("run_shell", ToolPermission::Deny)]));
        policy.set_for_session("run_shell", ToolPermission::Allow);
        assert!(policy.is_allowed("run_shell"));
        policy.clear_session();
        assert!(!policy.is_allowed("run_shell"));
    }

    #[test]
    fn test_permission_serialization() {
        assert_eq!(serde_json::to_string(&ToolPermission::Deny).unwrap(), "\"deny\"");
        let p: ToolPermission = serde_json::from_str("\"allow\"").unwrap();
        assert_eq!(p, ToolPermission::Allow);
    }
}
