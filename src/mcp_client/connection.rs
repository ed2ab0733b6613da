//! Long-lived connection to one tool provider.
//!
//! Owns the liveness state machine:
//!
//! ```text
//! starting ──handshake ok──▶ ready ◀──success── degraded
//!     │                        │                   │
//!     └─handshake failed─▶ terminated ◀─N failures─┘ (restarted once first)
//! ```
//!
//! Calls are serialized through a single gate so exactly one request is in
//! flight per provider. After `failure_threshold` consecutive timeouts or
//! malformed responses, or when the provider's channel closes, the provider
//! is restarted once; the next exhaustion marks it permanently terminated.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex};

use super::errors::McpError;
use super::lifecycle::{self, format_stderr_suffix, ProviderLauncher, ProviderProcess};
use super::transport::{extract_result, JsonRpcTransport};
use super::types::{ToolDescriptor, PROTOCOL_VERSION};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Automatic restarts granted per provider per session.
const MAX_AUTOMATIC_RESTARTS: u32 = 1;

// ─── Liveness ────────────────────────────────────────────────────────────────

/// Observable health of a provider connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Starting,
    Ready,
    Degraded,
    Terminated,
}

impl std::fmt::Display for Liveness {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Liveness::Starting => "starting",
            Liveness::Ready => "ready",
            Liveness::Degraded => "degraded",
            Liveness::Terminated => "terminated",
        };
        f.write_str(label)
    }
}

/// Tunables shared by every connection in a pool.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Consecutive failures before a restart (or termination).
    pub failure_threshold: u32,
    pub handshake_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub protocol_version: String,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            handshake_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(5),
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }
}

// ─── ProviderConnection ──────────────────────────────────────────────────────

struct Session {
    transport: JsonRpcTransport,
    process: Option<ProviderProcess>,
}

struct ConnectionState {
    session: Option<Session>,
    consecutive_failures: u32,
}

/// One provider's connection, shared by every conversation.
pub struct ProviderConnection {
    name: String,
    launcher: Arc<dyn ProviderLauncher>,
    settings: ConnectionSettings,
    /// Held for the whole duration of a call: one in-flight request.
    gate: Mutex<ConnectionState>,
    liveness: watch::Sender<Liveness>,
    tools: RwLock<Vec<ToolDescriptor>>,
    launches: AtomicU32,
    restarts: AtomicU32,
}

impl ProviderConnection {
    /// Create an unstarted connection. The provider is launched on first use.
    pub fn new(
        name: &str,
        launcher: Arc<dyn ProviderLauncher>,
        settings: ConnectionSettings,
    ) -> Self {
        let (liveness, _) = watch::channel(Liveness::Starting);
        Self {
            name: name.to_string(),
            launcher,
            settings,
            gate: Mutex::new(ConnectionState {
                session: None,
                consecutive_failures: 0,
            }),
            liveness,
            tools: RwLock::new(Vec::new()),
            launches: AtomicU32::new(0),
            restarts: AtomicU32::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current liveness state.
    pub fn liveness(&self) -> Liveness {
        *self.liveness.borrow()
    }

    /// Watch liveness transitions.
    pub fn subscribe(&self) -> watch::Receiver<Liveness> {
        self.liveness.subscribe()
    }

    /// Capability set advertised at the most recent handshake.
    pub fn tools(&self) -> Vec<ToolDescriptor> {
        self.tools
            .read()
            .map(|t| t.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// How many times the provider has been launched (initial start included).
    pub fn launch_count(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }

    /// How many automatic restarts have been used.
    pub fn restart_count(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    /// Launch and handshake now if not already running.
    pub async fn start(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        let mut state = self.gate.lock().await;
        self.ensure_session(&mut state).await?;
        Ok(self.tools())
    }

    /// Send one request and wait for its result.
    ///
    /// Timeouts and malformed responses count toward the failure threshold
    /// and are never retried. A crashed provider is restarted (once per
    /// session) and the request is retried a single time.
    pub async fn call(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, McpError> {
        let mut state = self.gate.lock().await;
        self.ensure_session(&mut state).await?;

        if session_closed(&state) {
            self.recover_from_crash(&mut state).await?;
        }

        let mut retried = false;
        loop {
            let outcome = self.exchange(&state, method, params.clone(), timeout).await;

            if matches!(outcome, Err(McpError::TransportError { .. })) && session_closed(&state) {
                self.recover_from_crash(&mut state).await?;
                if !retried {
                    retried = true;
                    continue;
                }
            }

            self.record(&mut state, &outcome).await;
            return outcome;
        }
    }

    /// Tear the provider down and mark it terminated.
    pub async fn shutdown(&self) {
        let mut state = self.gate.lock().await;
        self.close_session(&mut state).await;
        self.set_liveness(Liveness::Terminated);
        tracing::info!(provider = %self.name, "provider shut down");
    }

    // ─── Internals ───────────────────────────────────────────────────────

    async fn ensure_session(&self, state: &mut ConnectionState) -> Result<(), McpError> {
        if self.liveness() == Liveness::Terminated {
            return Err(self.unavailable());
        }
        if state.session.is_some() {
            return Ok(());
        }
        if let Err(e) = self.open_session(state).await {
            self.set_liveness(Liveness::Terminated);
            return Err(e);
        }
        Ok(())
    }

    async fn open_session(&self, state: &mut ConnectionState) -> Result<(), McpError> {
        self.set_liveness(Liveness::Starting);
        self.launches.fetch_add(1, Ordering::SeqCst);

        let mut launched = self.launcher.launch(&self.name).await?;
        let tools = match lifecycle::handshake(
            &launched.transport,
            &self.name,
            &self.settings.protocol_version,
            self.settings.handshake_timeout,
        )
        .await
        {
            Ok(tools) => tools,
            Err(e) => {
                let stderr = match launched.process.as_mut() {
                    Some(process) => {
                        let tail = process.stderr_tail().await;
                        process.stop(Duration::ZERO).await;
                        tail
                    }
                    None => String::new(),
                };
                if !stderr.is_empty() {
                    tracing::warn!(
                        provider = %self.name,
                        stderr = %stderr,
                        "provider stderr captured on failed handshake"
                    );
                }
                return Err(McpError::InitFailed {
                    name: self.name.clone(),
                    reason: format!("{e}{}", format_stderr_suffix(&stderr)),
                });
            }
        };

        tracing::info!(
            provider = %self.name,
            tool_count = tools.len(),
            "provider handshake complete"
        );

        match self.tools.write() {
            Ok(mut guard) => *guard = tools,
            Err(poisoned) => *poisoned.into_inner() = tools,
        }
        state.session = Some(Session {
            transport: launched.transport,
            process: launched.process,
        });
        state.consecutive_failures = 0;
        self.set_liveness(Liveness::Ready);
        Ok(())
    }

    async fn exchange(
        &self,
        state: &ConnectionState,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value, McpError> {
        let session = state.session.as_ref().ok_or_else(|| self.unavailable())?;
        let response = session.transport.request(method, params, timeout).await?;
        extract_result(&self.name, response)
    }

    async fn record(
        &self,
        state: &mut ConnectionState,
        outcome: &Result<serde_json::Value, McpError>,
    ) {
        match outcome {
            Err(e) if e.is_connection_failure() => self.on_failure(state, e).await,
            _ => self.on_success(state),
        }
    }

    fn on_success(&self, state: &mut ConnectionState) {
        state.consecutive_failures = 0;
        if self.liveness() == Liveness::Degraded {
            tracing::info!(provider = %self.name, "provider recovered");
            self.set_liveness(Liveness::Ready);
        }
    }

    async fn on_failure(&self, state: &mut ConnectionState, err: &McpError) {
        state.consecutive_failures += 1;
        tracing::warn!(
            provider = %self.name,
            failures = state.consecutive_failures,
            threshold = self.settings.failure_threshold,
            error = %err,
            "provider request failed"
        );

        if state.consecutive_failures < self.settings.failure_threshold {
            self.set_liveness(Liveness::Degraded);
            return;
        }

        if let Err(e) = self.restart_or_terminate(state).await {
            tracing::error!(provider = %self.name, error = %e, "provider restart failed");
        }
    }

    async fn recover_from_crash(&self, state: &mut ConnectionState) -> Result<(), McpError> {
        tracing::warn!(provider = %self.name, "provider channel closed, treating as crash");
        self.restart_or_terminate(state)
            .await
            .map_err(|_| self.unavailable())
    }

    async fn restart_or_terminate(&self, state: &mut ConnectionState) -> Result<(), McpError> {
        self.close_session(state).await;
        self.set_liveness(Liveness::Terminated);

        if self.restarts.load(Ordering::SeqCst) >= MAX_AUTOMATIC_RESTARTS {
            tracing::error!(
                provider = %self.name,
                "provider marked permanently unavailable for this session"
            );
            return Err(McpError::RestartExhausted {
                name: self.name.clone(),
                attempts: MAX_AUTOMATIC_RESTARTS,
            });
        }

        self.restarts.fetch_add(1, Ordering::SeqCst);
        tracing::info!(provider = %self.name, "restarting provider");

        if let Err(e) = self.open_session(state).await {
            self.set_liveness(Liveness::Terminated);
            return Err(e);
        }
        Ok(())
    }

    async fn close_session(&self, state: &mut ConnectionState) {
        if let Some(mut session) = state.session.take() {
            let _ = session.transport.notify("shutdown", None).await;
            if let Some(process) = session.process.as_mut() {
                process.stop(self.settings.shutdown_timeout).await;
            }
        }
    }

    fn set_liveness(&self, next: Liveness) {
        let previous = self.liveness.send_replace(next);
        if previous != next {
            tracing::info!(
                provider = %self.name,
                from = %previous,
                to = %next,
                "provider liveness changed"
            );
        }
    }

    fn unavailable(&self) -> McpError {
        McpError::ProviderUnavailable {
            name: self.name.clone(),
        }
    }
}

fn session_closed(state: &ConnectionState) -> bool {
    state
        .session
        .as_ref()
        .is_some_and(|s| s.transport.is_closed())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::lifecycle::LaunchedProvider;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[derive(Clone, Copy)]
    enum Reply {
        Echo,
        Silent,
        Close,
        Slow(u64),
    }

    /// In-memory provider: `handle(method, launch_number)` decides each reply.
    struct ScriptedLauncher {
        handle: fn(&str, u32) -> Reply,
        launches: AtomicU32,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
    }

    impl ScriptedLauncher {
        fn new(handle: fn(&str, u32) -> Reply) -> Arc<Self> {
            Arc::new(Self {
                handle,
                launches: AtomicU32::new(0),
                in_flight: Arc::new(AtomicUsize::new(0)),
                max_in_flight: Arc::new(AtomicUsize::new(0)),
            })
        }
    }

    #[async_trait]
    impl ProviderLauncher for ScriptedLauncher {
        async fn launch(&self, name: &str) -> Result<LaunchedProvider, McpError> {
            let launch_no = self.launches.fetch_add(1, Ordering::SeqCst) + 1;
            let handle = self.handle;
            let in_flight = self.in_flight.clone();
            let max_in_flight = self.max_in_flight.clone();

            let (client, server) = tokio::io::duplex(64 * 1024);
            let (client_r, client_w) = tokio::io::split(client);
            let (server_r, server_w) = tokio::io::split(server);
            let writer = Arc::new(Mutex::new(server_w));

            tokio::spawn(async move {
                let mut lines = BufReader::new(server_r).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let req: serde_json::Value = match serde_json::from_str(&line) {
                        Ok(v) => v,
                        Err(_) => continue,
                    };
                    let Some(id) = req.get("id").cloned() else {
                        continue;
                    };
                    let method = req["method"].as_str().unwrap_or_default().to_string();
                    let reply = match method.as_str() {
                        "initialize" => Reply::Echo,
                        _ => handle(&method, launch_no),
                    };
                    let result = if method == "initialize" {
                        serde_json::json!({"tools": [{"name": "echo"}]})
                    } else {
                        serde_json::json!({"method": method, "launch": launch_no})
                    };
                    let body = serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result});

                    match reply {
                        Reply::Echo => {
                            let mut w = writer.lock().await;
                            let _ = w.write_all(format!("{body}\n").as_bytes()).await;
                        }
                        Reply::Silent => {}
                        Reply::Close => break,
                        Reply::Slow(ms) => {
                            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                            max_in_flight.fetch_max(now, Ordering::SeqCst);
                            let writer = writer.clone();
                            let in_flight = in_flight.clone();
                            tokio::spawn(async move {
                                tokio::time::sleep(Duration::from_millis(ms)).await;
                                in_flight.fetch_sub(1, Ordering::SeqCst);
                                let mut w = writer.lock().await;
                                let _ = w.write_all(format!("{body}\n").as_bytes()).await;
                            });
                        }
                    }
                }
            });

            Ok(LaunchedProvider {
                transport: JsonRpcTransport::new(name, client_r, client_w),
                process: None,
            })
        }
    }

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            handshake_timeout: Duration::from_secs(2),
            shutdown_timeout: Duration::from_millis(10),
            ..ConnectionSettings::default()
        }
    }

    fn short() -> Duration {
        Duration::from_millis(30)
    }

    #[tokio::test]
    async fn test_start_reaches_ready_with_tools() {
        let launcher = ScriptedLauncher::new(|_, _| Reply::Echo);
        let conn = ProviderConnection::new("p", launcher, settings());
        assert_eq!(conn.liveness(), Liveness::Starting);

        let tools = conn.start().await.unwrap();
        assert_eq!(tools[0].name, "echo");
        assert_eq!(conn.liveness(), Liveness::Ready);
        assert_eq!(conn.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_first_call_starts_lazily() {
        let launcher = ScriptedLauncher::new(|_, _| Reply::Echo);
        let conn = ProviderConnection::new("p", launcher, settings());
        let value = conn.call("tools/call", None, short()).await.unwrap();
        assert_eq!(value["method"], "tools/call");
        assert_eq!(conn.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_timeout_degrades_and_success_recovers() {
        let launcher = ScriptedLauncher::new(|method, _| match method {
            "hang" => Reply::Silent,
            _ => Reply::Echo,
        });
        let conn = ProviderConnection::new("p", launcher, settings());

        let err = conn.call("hang", None, short()).await.unwrap_err();
        assert!(matches!(err, McpError::Timeout { .. }));
        assert_eq!(conn.liveness(), Liveness::Degraded);

        conn.call("ok", None, short()).await.unwrap();
        assert_eq!(conn.liveness(), Liveness::Ready);
    }

    #[tokio::test]
    async fn test_threshold_restarts_once_then_terminates() {
        let launcher = ScriptedLauncher::new(|method, _| match method {
            "hang" => Reply::Silent,
            _ => Reply::Echo,
        });
        let conn = ProviderConnection::new("p", launcher, settings());

        for _ in 0..3 {
            let _ = conn.call("hang", None, short()).await;
        }
        assert_eq!(conn.restart_count(), 1);
        assert_eq!(conn.launch_count(), 2);
        assert_eq!(conn.liveness(), Liveness::Ready);

        // Restarted provider still answers.
        let value = conn.call("ok", None, short()).await.unwrap();
        assert_eq!(value["launch"], 2);

        for _ in 0..3 {
            let _ = conn.call("hang", None, short()).await;
        }
        assert_eq!(conn.liveness(), Liveness::Terminated);

        let err = conn.call("ok", None, short()).await.unwrap_err();
        assert!(matches!(err, McpError::ProviderUnavailable { .. }));
        assert_eq!(conn.launch_count(), 2);
    }

    #[tokio::test]
    async fn test_crash_restarts_and_retries_call() {
        let launcher = ScriptedLauncher::new(|method, launch| match (method, launch) {
            ("boom", 1) => Reply::Close,
            _ => Reply::Echo,
        });
        let conn = ProviderConnection::new("p", launcher, settings());

        let value = conn
            .call("boom", None, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(value["launch"], 2);
        assert_eq!(conn.restart_count(), 1);
        assert_eq!(conn.liveness(), Liveness::Ready);
    }

    #[tokio::test]
    async fn test_second_crash_is_unavailable() {
        let launcher = ScriptedLauncher::new(|method, _| match method {
            "boom" => Reply::Close,
            _ => Reply::Echo,
        });
        let conn = ProviderConnection::new("p", launcher, settings());

        let err = conn
            .call("boom", None, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ProviderUnavailable { .. }));
        assert_eq!(conn.liveness(), Liveness::Terminated);
    }

    #[tokio::test]
    async fn test_concurrent_calls_are_serialized() {
        let launcher = ScriptedLauncher::new(|_, _| Reply::Slow(20));
        let conn = Arc::new(ProviderConnection::new("p", launcher.clone(), settings()));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let conn = conn.clone();
            handles.push(tokio::spawn(async move {
                conn.call("work", None, Duration::from_secs(2)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(launcher.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_liveness_is_observable() {
        let launcher = ScriptedLauncher::new(|_, _| Reply::Echo);
        let conn = ProviderConnection::new("p", launcher, settings());
        let mut rx = conn.subscribe();
        conn.start().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), Liveness::Ready);

        conn.shutdown().await;
        assert_eq!(*rx.borrow_and_update(), Liveness::Terminated);
    }
}
