//! Provider process lifecycle.
//!
//! Launching a provider (spawning a child process with piped stdio), the
//! capability handshake, and graceful shutdown. Launching sits behind the
//! [`ProviderLauncher`] trait so connections can be driven by in-memory
//! providers in tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::transport::{extract_result, JsonRpcTransport};
use super::types::{InitializeResult, ProviderConfig, ToolDescriptor, ToolsListResult};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Bytes of recent stderr kept per provider for error reports.
const STDERR_CAPTURE_LIMIT: usize = 2000;

/// How long to let the stderr reader catch up after a failed start.
const STDERR_READ_TIMEOUT: Duration = Duration::from_millis(500);

// ─── Launching ───────────────────────────────────────────────────────────────

/// A freshly launched provider: its channel and, for real processes, the child.
pub struct LaunchedProvider {
    pub transport: JsonRpcTransport,
    pub process: Option<ProviderProcess>,
}

/// Starts one provider instance. Called once at first use and once more for
/// the automatic restart.
#[async_trait]
pub trait ProviderLauncher: Send + Sync {
    async fn launch(&self, name: &str) -> Result<LaunchedProvider, McpError>;
}

/// Launches a provider as a child process speaking JSON-RPC over stdio.
pub struct ProcessLauncher {
    config: ProviderConfig,
}

impl ProcessLauncher {
    pub fn new(config: ProviderConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ProviderLauncher for ProcessLauncher {
    async fn launch(&self, name: &str) -> Result<LaunchedProvider, McpError> {
        if self.config.command.trim().is_empty() {
            return Err(McpError::ConfigError {
                reason: format!("provider '{name}' has an empty command"),
            });
        }

        let mut cmd = Command::new(&self.config.command);
        cmd.args(&self.config.args);
        for (key, value) in &self.config.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.config.cwd {
            cmd.current_dir(dir);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::SpawnFailed {
            name: name.to_string(),
            reason: format!("{e}"),
        })?;

        let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
            name: name.to_string(),
            reason: "failed to capture stdout".into(),
        })?;
        // Drained from the start: a provider that logs more than the pipe
        // buffer would otherwise block on its next write.
        let stderr = child.stderr.take().map(|pipe| StderrDrain::spawn(name, pipe));

        tracing::info!(
            provider = name,
            command = %self.config.command,
            pid = child.id().unwrap_or_default(),
            "spawned tool provider"
        );

        Ok(LaunchedProvider {
            transport: JsonRpcTransport::new(name, stdout, stdin),
            process: Some(ProviderProcess { child, stderr }),
        })
    }
}

// ─── Process Handle ──────────────────────────────────────────────────────────

/// A running provider child process.
pub struct ProviderProcess {
    child: Child,
    stderr: Option<StderrDrain>,
}

impl ProviderProcess {
    /// The most recent stderr output, at most `STDERR_CAPTURE_LIMIT` bytes.
    ///
    /// Gives the reader a moment to collect what an exiting process wrote
    /// last; a process that is still running returns what was read so far.
    pub async fn stderr_tail(&mut self) -> String {
        let Some(drain) = self.stderr.as_mut() else {
            return String::new();
        };
        if !drain.task.is_finished() {
            let _ = tokio::time::timeout(STDERR_READ_TIMEOUT, &mut drain.task).await;
        }
        drain.snapshot()
    }

    /// Wait for the process to exit, killing it after `grace`.
    pub async fn stop(&mut self, grace: Duration) {
        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(status = %status, "provider exited"),
            _ => {
                let _ = self.child.kill().await;
            }
        }
    }
}

// ─── Stderr ──────────────────────────────────────────────────────────────────

/// Background reader that keeps a provider's stderr pipe empty.
struct StderrDrain {
    tail: Arc<Mutex<StderrTail>>,
    task: JoinHandle<()>,
}

impl StderrDrain {
    fn spawn<R>(provider: &str, pipe: R) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let tail = Arc::new(Mutex::new(StderrTail::default()));
        let sink = tail.clone();
        let provider = provider.to_string();

        let task = tokio::spawn(async move {
            let mut reader = BufReader::new(pipe);
            let mut line = Vec::new();
            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let text = String::from_utf8_lossy(&line);
                        let text = text.trim_end();
                        tracing::debug!(provider = %provider, line = %text, "provider stderr");
                        match sink.lock() {
                            Ok(mut tail) => tail.push(text),
                            Err(poisoned) => poisoned.into_inner().push(text),
                        }
                    }
                    Err(e) => {
                        tracing::debug!(provider = %provider, error = %e, "stderr read failed");
                        break;
                    }
                }
            }
        });

        Self { tail, task }
    }

    fn snapshot(&self) -> String {
        match self.tail.lock() {
            Ok(tail) => tail.render(),
            Err(poisoned) => poisoned.into_inner().render(),
        }
    }
}

/// The last `STDERR_CAPTURE_LIMIT` bytes of stderr, kept line by line.
#[derive(Debug, Default)]
struct StderrTail {
    lines: VecDeque<String>,
    bytes: usize,
    dropped: bool,
}

impl StderrTail {
    fn push(&mut self, line: &str) {
        let kept = tail_of(line, STDERR_CAPTURE_LIMIT);
        if kept.len() < line.len() {
            self.dropped = true;
        }
        self.bytes += kept.len() + 1;
        self.lines.push_back(kept.to_string());
        while self.bytes > STDERR_CAPTURE_LIMIT + 1 && self.lines.len() > 1 {
            if let Some(old) = self.lines.pop_front() {
                self.bytes -= old.len() + 1;
                self.dropped = true;
            }
        }
    }

    fn render(&self) -> String {
        let joined = self
            .lines
            .iter()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n");
        if self.dropped {
            format!("...(truncated) {joined}")
        } else {
            joined
        }
    }
}

/// The last `max_bytes` of `s`, starting on a char boundary.
fn tail_of(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut start = s.len() - max_bytes;
    while start < s.len() && !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

// ─── Handshake ───────────────────────────────────────────────────────────────

/// Perform the capability handshake: `initialize`, then `tools/list` unless
/// the provider already inlined its tools.
pub async fn handshake(
    transport: &JsonRpcTransport,
    name: &str,
    protocol_version: &str,
    timeout: Duration,
) -> Result<Vec<ToolDescriptor>, McpError> {
    let params = serde_json::json!({
        "protocolVersion": protocol_version,
        "capabilities": {},
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
    });

    let response = transport
        .request("initialize", Some(params), timeout)
        .await
        .map_err(|e| init_failed(name, e))?;
    let result = extract_result(name, response).map_err(|e| init_failed(name, e))?;
    let init: InitializeResult =
        serde_json::from_value(result).map_err(|e| McpError::InitFailed {
            name: name.to_string(),
            reason: format!("failed to parse initialize response: {e}"),
        })?;

    if let Some(version) = &init.protocol_version {
        if version != protocol_version {
            tracing::warn!(
                provider = name,
                ours = protocol_version,
                theirs = %version,
                "provider negotiated a different protocol version"
            );
        }
    }

    if let Some(tools) = init.tools {
        return Ok(tools);
    }

    let response = transport
        .request("tools/list", None, timeout)
        .await
        .map_err(|e| init_failed(name, e))?;
    let result = extract_result(name, response).map_err(|e| init_failed(name, e))?;
    let listed: ToolsListResult =
        serde_json::from_value(result).map_err(|e| McpError::InitFailed {
            name: name.to_string(),
            reason: format!("failed to parse tools/list response: {e}"),
        })?;

    Ok(listed.tools)
}

fn init_failed(name: &str, e: McpError) -> McpError {
    McpError::InitFailed {
        name: name.to_string(),
        reason: e.to_string(),
    }
}

/// Format a stderr suffix for error messages (empty string if no stderr).
pub fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.trim().is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
