use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use toolchat::agent_core::{AgentError, TerminalState, TurnOutcome};
use toolchat::config::{find_config_path, AppConfig};
use toolchat::inference::InferenceClient;
use toolchat::mcp_client::ProviderPool;
use toolchat::{Agent, ChatSession};

/// Chat with a local model that can call tools.
#[derive(Debug, Parser)]
#[command(name = "toolchat", version, about)]
struct Args {
    /// Config file (default: $TOOLCHAT_CONFIG, then toolchat.yaml searched upward).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Document to attach to the conversation.
    #[arg(short, long)]
    document: Option<PathBuf>,

    /// Directory for agent.log (default: the platform data directory).
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_path = toolchat::init_tracing(args.log_dir.as_deref()).context("failed to set up logging")?;
    let config = load_config(args.config.as_deref())?;

    let model = Arc::new(InferenceClient::new(config.model.clone()).context("failed to build model client")?);
    if !model.health_check().await {
        eprintln!(
            "warning: model endpoint {} is not responding; turns will fail until it is up",
            model.base_url()
        );
    }

    let pool = Arc::new(ProviderPool::from_config(
        &config.providers,
        config.protocol.connection_settings(),
    ));
    let discovery = pool.discover().await;
    for (provider, error) in &discovery.failures {
        eprintln!("warning: provider '{provider}' unavailable: {error}");
    }
    eprintln!(
        "{} tools from {} providers; logging to {}",
        discovery.registry.len(),
        discovery.registry.provider_names().len(),
        log_path.display()
    );

    let agent = Arc::new(Agent::from_config(
        &config,
        model,
        pool.clone(),
        Arc::new(discovery.registry),
    ));
    let mut session = ChatSession::new(agent, config.retrieval.clone())?;

    if let Some(path) = args.document.as_deref() {
        attach(&mut session, path).await?;
    }

    let result = chat(&mut session, &pool).await;
    pool.shutdown_all().await;
    result
}

fn load_config(explicit: Option<&std::path::Path>) -> Result<AppConfig> {
    let path = match explicit {
        Some(path) => Some(path.to_path_buf()),
        None => find_config_path(&std::env::current_dir().context("no working directory")?),
    };
    match path {
        Some(path) => AppConfig::load(&path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => {
            tracing::info!("no config file found, using defaults");
            Ok(AppConfig::default())
        }
    }
}

async fn attach(session: &mut ChatSession, path: &std::path::Path) -> Result<()> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    let source = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let chunks = session.attach_document(&source, &text).await?;
    eprintln!("attached {source} ({chunks} chunks)");
    Ok(())
}

/// Read user lines from stdin until EOF or `/quit`.
///
/// `/attach <path>` and `/detach` manage the document, `/status` lists
/// provider liveness; Ctrl-C cancels the turn in flight.
async fn chat(session: &mut ChatSession, pool: &ProviderPool) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            break;
        }
        if line == "/status" {
            for (provider, liveness) in pool.liveness_snapshot() {
                eprintln!("  {provider}: {liveness}");
            }
            continue;
        }
        if line == "/detach" {
            session.detach_document();
            continue;
        }
        if let Some(path) = line.strip_prefix("/attach ") {
            if let Err(e) = attach(session, std::path::Path::new(path.trim())).await {
                eprintln!("error: {e:#}");
            }
            continue;
        }

        let handle = session.begin_turn(line).await?;
        let cancel = handle.cancel_token();
        let watcher = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
        let result = session.finish_turn(handle).await;
        watcher.abort();

        match result {
            Ok(outcome) => print_outcome(&outcome),
            Err(AgentError::ModelUnreachable { reason }) => {
                eprintln!("error: model unreachable: {reason}");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

fn print_outcome(outcome: &TurnOutcome) {
    for entry in &outcome.transcript {
        let status = match entry.error_kind {
            None => "ok".to_string(),
            Some(kind) => kind.to_string(),
        };
        eprintln!(
            "  [{status}] {} ({}ms): {}",
            entry.tool_name, entry.latency_ms, entry.summarized_output
        );
    }
    match outcome.state {
        TerminalState::Completed => {}
        TerminalState::Cancelled => eprintln!("  (cancelled)"),
        TerminalState::Aborted(reason) => eprintln!("  (aborted: {reason:?})"),
    }
    println!("{}\n", outcome.final_text);
}
