//! Application configuration loading and validation.
//!
//! Reads `toolchat.yaml` and resolves environment variables. Every field has a
//! default, so a partial file (or no file at all) yields a usable config.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::agent_core::policy::ToolPermission;
use crate::mcp_client::types::{ProviderConfig, ToolClass, PROTOCOL_VERSION};
use crate::mcp_client::ConnectionSettings;

/// Config file name searched for in the working directory and its parents.
pub const CONFIG_FILE_NAME: &str = "toolchat.yaml";

/// Environment variable that points directly at a config file.
pub const CONFIG_ENV_VAR: &str = "TOOLCHAT_CONFIG";

// ─── Errors ──────────────────────────────────────────────────────────────────

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse config: {reason}")]
    Parse { reason: String },

    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

// ─── Public Types ────────────────────────────────────────────────────────────

/// Top-level configuration (mirrors `toolchat.yaml`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub model: ModelConfig,
    pub budget: BudgetConfig,
    pub agent: AgentConfig,
    pub protocol: ProtocolConfig,
    pub retrieval: RetrievalConfig,
    pub providers: HashMap<String, ProviderConfig>,
    pub tool_timeouts: ToolTimeouts,
    /// Per-tool allow/deny. Tools not listed are allowed.
    pub tool_policy: HashMap<String, ToolPermission>,
}

/// The model endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// OpenAI-compatible base URL, e.g. `http://localhost:8080/v1`.
    pub base_url: String,
    pub model_name: String,
    pub context_window: u32,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
    /// Name of the environment variable holding a bearer token, if any.
    pub api_key_env: Option<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/v1".to_string(),
            model_name: "local".to_string(),
            context_window: 8192,
            temperature: 0.3,
            max_tokens: 512,
            request_timeout_secs: 120,
            api_key_env: None,
        }
    }
}

/// Context window reservations.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Tokens kept free for the model's reply.
    pub output_reservation: u32,
    /// Slack for estimator error.
    pub safety_buffer: u32,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            output_reservation: 512,
            safety_buffer: 128,
        }
    }
}

/// Orchestration loop caps.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub max_iterations: u32,
    pub turn_timeout_secs: u64,
    pub max_tool_result_chars: usize,
    pub max_repair_attempts: u32,
    pub max_duplicate_calls: usize,
    /// Reject unknown tool names and bad arguments in the decision engine
    /// (triggering repair) instead of letting the dispatcher report them.
    pub enforce_tool_enum: bool,
    /// Replaces the built-in system prompt intro.
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 8,
            turn_timeout_secs: 300,
            max_tool_result_chars: 4000,
            max_repair_attempts: 2,
            max_duplicate_calls: 2,
            enforce_tool_enum: false,
            system_prompt: None,
        }
    }
}

/// Tool provider connection tunables.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    pub failure_threshold: u32,
    pub handshake_timeout_secs: u64,
    pub shutdown_timeout_secs: u64,
    pub protocol_version: String,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            handshake_timeout_secs: 30,
            shutdown_timeout_secs: 5,
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }
}

impl ProtocolConfig {
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            failure_threshold: self.failure_threshold,
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            shutdown_timeout: Duration::from_secs(self.shutdown_timeout_secs),
            protocol_version: self.protocol_version.clone(),
        }
    }
}

/// Document retrieval settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub chunk_size_lines: usize,
    pub overlap_lines: usize,
    pub top_k: usize,
    pub min_similarity: f32,
    /// OpenAI-compatible embeddings endpoint. When unset the local hashing
    /// embedder is used.
    pub embedding_endpoint: Option<String>,
    pub embedding_dim: usize,
    /// Keep document embeddings under `<data_dir>/embeddings` so an unchanged
    /// document is not embedded twice.
    pub embedding_cache: bool,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            chunk_size_lines: 40,
            overlap_lines: 5,
            top_k: 3,
            min_similarity: 0.3,
            embedding_endpoint: None,
            embedding_dim: 256,
            embedding_cache: true,
        }
    }
}

/// Default call timeout per tool class, in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolTimeouts {
    pub filesystem_ms: u64,
    pub shell_ms: u64,
    pub network_ms: u64,
    pub default_ms: u64,
}

impl Default for ToolTimeouts {
    fn default() -> Self {
        Self {
            filesystem_ms: 5_000,
            shell_ms: 30_000,
            network_ms: 20_000,
            default_ms: 15_000,
        }
    }
}

impl ToolTimeouts {
    pub fn for_class(&self, class: ToolClass) -> Duration {
        let ms = match class {
            ToolClass::Filesystem => self.filesystem_ms,
            ToolClass::Shell => self.shell_ms,
            ToolClass::Network => self.network_ms,
            ToolClass::Default => self.default_ms,
        };
        Duration::from_millis(ms)
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Parse a YAML document, interpolating `${VAR}` / `${VAR:-default}`.
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let interpolated = interpolate_env_vars(raw);
        if interpolated.trim().is_empty() {
            return Ok(Self::default());
        }
        let mut config: AppConfig =
            serde_yaml::from_str(&interpolated).map_err(|e| ConfigError::Parse {
                reason: e.to_string(),
            })?;
        for provider in config.providers.values_mut() {
            provider.command = expand_tilde(&provider.command);
            provider.cwd = provider.cwd.as_deref().map(expand_tilde);
        }
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Reject values that would make the loop or the budgeter degenerate.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| {
            Err(ConfigError::Invalid {
                reason: reason.to_string(),
            })
        };

        if self.model.context_window == 0 {
            return invalid("model.context_window must be > 0");
        }
        if self.agent.max_iterations == 0 {
            return invalid("agent.max_iterations must be > 0");
        }
        if self.agent.turn_timeout_secs == 0 {
            return invalid("agent.turn_timeout_secs must be > 0");
        }
        if self.agent.max_tool_result_chars == 0 {
            return invalid("agent.max_tool_result_chars must be > 0");
        }
        if self.agent.max_duplicate_calls == 0 {
            return invalid("agent.max_duplicate_calls must be > 0");
        }
        if self.protocol.failure_threshold == 0 {
            return invalid("protocol.failure_threshold must be > 0");
        }
        if self.retrieval.chunk_size_lines == 0 {
            return invalid("retrieval.chunk_size_lines must be > 0");
        }
        if self.retrieval.overlap_lines >= self.retrieval.chunk_size_lines {
            return invalid("retrieval.overlap_lines must be smaller than chunk_size_lines");
        }
        if self.retrieval.embedding_dim == 0 {
            return invalid("retrieval.embedding_dim must be > 0");
        }
        let reserved = self.budget.output_reservation + self.budget.safety_buffer;
        if reserved >= self.model.context_window {
            return invalid("budget reservations leave no room in the context window");
        }
        for (name, provider) in &self.providers {
            if provider.command.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    reason: format!("provider '{name}' has an empty command"),
                });
            }
        }
        Ok(())
    }
}

/// Locate the config file.
///
/// Checks `TOOLCHAT_CONFIG` first, then walks upward from `start` looking for
/// `toolchat.yaml`.
pub fn find_config_path(start: &Path) -> Option<PathBuf> {
    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        let candidate = PathBuf::from(path);
        if candidate.exists() {
            return Some(candidate);
        }
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.exists() {
            return Some(candidate);
        }
        if !dir.pop() {
            return None;
        }
    }
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Replace `${VAR}` and `${VAR:-default}` in a string.
fn interpolate_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_expr = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_expr.push(c);
            }
            result.push_str(&resolve_var_expr(&var_expr));
        } else {
            result.push(ch);
        }
    }

    result
}

/// Resolve a variable expression like `VAR` or `VAR:-default`.
fn resolve_var_expr(expr: &str) -> String {
    if let Some((var_name, default)) = expr.split_once(":-") {
        std::env::var(var_name).unwrap_or_else(|_| expand_tilde(default))
    } else {
        std::env::var(expr).unwrap_or_default()
    }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        if let Some(home) = dirs::home_dir() {
            return format!("{}{rest}", home.display());
        }
    }
    path.to_string()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
