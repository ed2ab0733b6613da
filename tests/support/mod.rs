//! Shared fixtures: a scripted model and an in-memory tool provider.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use toolchat::agent_core::{Agent, AgentSettings, ContextBudget, Dispatcher, ToolPolicy};
use toolchat::config::{BudgetConfig, ModelConfig, ToolTimeouts};
use toolchat::inference::{ChatMessage, ChatModel, InferenceError};
use toolchat::mcp_client::{
    ConnectionSettings, JsonRpcTransport, LaunchedProvider, McpError, ProviderLauncher,
    ProviderPool, ToolClass,
};

// ─── Model ──────────────────────────────────────────────────────────────────

/// Replays canned replies in order and records every prompt.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<Vec<ChatMessage>>>,
}

impl ScriptedModel {
    pub fn new<I, S>(replies: I) -> Arc<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Arc::new(Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            prompts: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    pub fn prompt(&self, call: usize) -> Vec<ChatMessage> {
        self.prompts.lock().unwrap()[call].clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        _schema: Option<&Value>,
    ) -> Result<String, InferenceError> {
        self.prompts.lock().unwrap().push(messages.to_vec());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| InferenceError::ConnectionFailed {
                endpoint: "scripted".into(),
                reason: "script exhausted".into(),
            })
    }
}

pub fn respond(text: &str) -> String {
    json!({"action": "respond", "final_text": text}).to_string()
}

pub fn tool_call(name: &str, arguments: Value) -> String {
    json!({"action": "tool_call", "tool_name": name, "arguments": arguments}).to_string()
}

// ─── Provider ───────────────────────────────────────────────────────────────

/// How the fake provider answers one `tools/call`.
pub enum Reply {
    Text(String),
    Error(String),
    /// Never answer.
    Hang,
}

type Handler = Arc<dyn Fn(&str, &Value) -> Reply + Send + Sync>;

/// In-memory provider speaking line-delimited JSON-RPC over a duplex pipe.
pub struct FakeProvider {
    tools: Value,
    handler: Handler,
    launches: Arc<AtomicUsize>,
}

impl FakeProvider {
    pub fn new<F>(tools: Value, handler: F) -> Self
    where
        F: Fn(&str, &Value) -> Reply + Send + Sync + 'static,
    {
        Self {
            tools,
            handler: Arc::new(handler),
            launches: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Counter of launches, shared with the launcher once registered.
    pub fn launches(&self) -> Arc<AtomicUsize> {
        self.launches.clone()
    }
}

#[async_trait]
impl ProviderLauncher for FakeProvider {
    async fn launch(&self, name: &str) -> Result<LaunchedProvider, McpError> {
        self.launches.fetch_add(1, Ordering::SeqCst);

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_r, client_w) = tokio::io::split(client);
        let (server_r, server_w) = tokio::io::split(server);
        let server_w = Arc::new(tokio::sync::Mutex::new(server_w));
        let tools = self.tools.clone();
        let handler = self.handler.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(server_r).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let Ok(request) = serde_json::from_str::<Value>(&line) else {
                    continue;
                };
                let Some(id) = request.get("id").cloned() else {
                    continue; // notification
                };
                let result = match request["method"].as_str() {
                    Some("initialize") => json!({
                        "protocolVersion": request["params"]["protocolVersion"],
                        "capabilities": {"tools": {}},
                        "serverInfo": {"name": "fake", "version": "0.0.0"}
                    }),
                    Some("tools/list") => json!({ "tools": tools }),
                    Some("tools/call") => {
                        let name = request["params"]["name"].as_str().unwrap_or_default();
                        match handler(name, &request["params"]["arguments"]) {
                            Reply::Text(text) => {
                                json!({"content": [{"type": "text", "text": text}]})
                            }
                            Reply::Error(text) => json!({
                                "content": [{"type": "text", "text": text}],
                                "isError": true
                            }),
                            Reply::Hang => continue,
                        }
                    }
                    _ => json!({}),
                };
                let body = json!({"jsonrpc": "2.0", "id": id, "result": result});
                let _ = server_w
                    .lock()
                    .await
                    .write_all(format!("{body}\n").as_bytes())
                    .await;
            }
        });

        Ok(LaunchedProvider {
            transport: JsonRpcTransport::new(name, client_r, client_w),
            process: None,
        })
    }
}

/// Tool list of a web provider: `web_search` and `fetch_webpage`.
pub fn web_tools() -> Value {
    json!([
        {
            "name": "web_search",
            "description": "Search the web for current information",
            "inputSchema": {
                "type": "object",
                "properties": {"query": {"type": "string"}},
                "required": ["query"]
            }
        },
        {
            "name": "fetch_webpage",
            "description": "Fetch a web page and return its text",
            "inputSchema": {
                "type": "object",
                "properties": {"url": {"type": "string"}},
                "required": ["url"]
            }
        }
    ])
}

// ─── Agent ──────────────────────────────────────────────────────────────────

/// A pool with one provider named `web`, not yet started.
pub fn pool_with(provider: FakeProvider, timeout: Option<Duration>) -> Arc<ProviderPool> {
    let mut pool = ProviderPool::new(ConnectionSettings::default());
    pool.register("web", Arc::new(provider), ToolClass::Network, timeout);
    Arc::new(pool)
}

/// A dispatcher over a freshly discovered `web` provider.
pub async fn dispatcher_for(
    provider: FakeProvider,
    timeout: Option<Duration>,
) -> (Dispatcher, Arc<ProviderPool>) {
    let pool = pool_with(provider, timeout);
    let discovery = pool.discover().await;
    assert!(discovery.failures.is_empty(), "fake provider failed to start");

    let dispatcher = Dispatcher::new(
        pool.clone(),
        Arc::new(discovery.registry),
        ToolPolicy::allow_all(),
        ToolTimeouts::default(),
    );
    (dispatcher, pool)
}

/// An agent over a freshly discovered `web` provider, default budget.
pub async fn agent_with(
    model: Arc<ScriptedModel>,
    provider: FakeProvider,
    timeout: Option<Duration>,
    settings: AgentSettings,
) -> (Arc<Agent>, Arc<ProviderPool>) {
    let (dispatcher, pool) = dispatcher_for(provider, timeout).await;
    let agent = Agent::new(
        model,
        dispatcher,
        ContextBudget::from_config(&ModelConfig::default(), &BudgetConfig::default()),
        settings,
    );
    (Arc::new(agent), pool)
}
