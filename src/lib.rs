pub mod agent_core;
pub mod config;
pub mod inference;
pub mod mcp_client;
pub mod retrieval;
pub mod session;

use std::path::{Path, PathBuf};

pub use agent_core::{Agent, AgentError, Conversation, TurnHandle, TurnOutcome};
pub use config::AppConfig;
pub use session::ChatSession;

/// Number of rotated log files kept next to `agent.log`.
const LOG_FILES_KEPT: u32 = 3;

/// Return the platform-standard data directory for toolchat.
///
/// - macOS: `~/Library/Application Support/toolchat/`
/// - Windows: `{FOLDERID_RoamingAppData}\toolchat\`
/// - Linux: `$XDG_DATA_HOME/toolchat/` (fallback `~/.local/share/toolchat/`)
///
/// Falls back to `~/.toolchat/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("toolchat");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolchat")
}

/// Install the tracing subscriber, writing structured logs to
/// `<log_dir>/agent.log` (default: [`data_dir`]).
///
/// On each start:
/// 1. Rotates existing logs (agent.log → agent.log.1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh agent.log with a line-flushing writer.
/// 3. Logs a startup banner with the log path.
///
/// Returns the log file path.
pub fn init_tracing(log_dir: Option<&Path>) -> std::io::Result<PathBuf> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let log_dir = log_dir.map(Path::to_path_buf).unwrap_or_else(data_dir);
    std::fs::create_dir_all(&log_dir)?;

    let log_path = log_dir.join("agent.log");
    rotate_log_file(&log_path, LOG_FILES_KEPT);

    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("toolchat=info,warn"));

    fmt::fmt()
        .with_env_filter(filter)
        .with_writer(FlushingWriter::new(log_file))
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .try_init()
        .map_err(|e| std::io::Error::other(format!("tracing already initialized: {e}")))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_dir = %log_dir.display(),
        log_file = %log_path.display(),
        pid = std::process::id(),
        "=== toolchat starting ==="
    );

    Ok(log_path)
}

/// Rotate log files: `agent.log` → `agent.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write, so
/// each log line is on disk even if the process dies mid-turn.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
