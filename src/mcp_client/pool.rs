//! Provider pool: the explicitly owned set of provider connections.
//!
//! Lifecycle:
//! 1. Build from configuration (`from_config`) or register launchers by hand.
//! 2. `discover()` at startup: launch and handshake every provider
//!    concurrently and build the tool registry. Partial failure is fine.
//! 3. `call_tool()` routes to a connection, creating it on first use.
//! 4. `shutdown_all()` at process exit.
//!
//! The pool is shared by every conversation and injected into the dispatcher.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use super::connection::{ConnectionSettings, Liveness, ProviderConnection};
use super::errors::McpError;
use super::lifecycle::{ProcessLauncher, ProviderLauncher};
use super::registry::ToolRegistry;
use super::types::{ProviderConfig, ToolClass};

struct ProviderEntry {
    launcher: Arc<dyn ProviderLauncher>,
    class: ToolClass,
    timeout: Option<Duration>,
}

/// Result of startup capability discovery.
pub struct Discovery {
    pub registry: ToolRegistry,
    /// Providers that failed to start, with the reason.
    pub failures: Vec<(String, McpError)>,
}

/// Owns one connection per configured provider.
pub struct ProviderPool {
    settings: ConnectionSettings,
    entries: BTreeMap<String, ProviderEntry>,
    connections: StdMutex<HashMap<String, Arc<ProviderConnection>>>,
}

impl ProviderPool {
    /// Create an empty pool.
    pub fn new(settings: ConnectionSettings) -> Self {
        Self {
            settings,
            entries: BTreeMap::new(),
            connections: StdMutex::new(HashMap::new()),
        }
    }

    /// Create a pool of process-backed providers.
    pub fn from_config(
        providers: &HashMap<String, ProviderConfig>,
        settings: ConnectionSettings,
    ) -> Self {
        let mut pool = Self::new(settings);
        for (name, config) in providers {
            pool.register(
                name,
                Arc::new(ProcessLauncher::new(config.clone())),
                config.tool_class,
                config.timeout_ms.map(Duration::from_millis),
            );
        }
        pool
    }

    /// Register a provider under `name`.
    pub fn register(
        &mut self,
        name: &str,
        launcher: Arc<dyn ProviderLauncher>,
        class: ToolClass,
        timeout: Option<Duration>,
    ) {
        self.entries.insert(
            name.to_string(),
            ProviderEntry {
                launcher,
                class,
                timeout,
            },
        );
    }

    /// Configured provider names, sorted.
    pub fn provider_names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Per-provider timeout override, if configured.
    pub fn timeout_override(&self, provider: &str) -> Option<Duration> {
        self.entries.get(provider).and_then(|e| e.timeout)
    }

    /// Get (or lazily create) the connection for a provider.
    pub fn connection(&self, name: &str) -> Result<Arc<ProviderConnection>, McpError> {
        let entry = self.entries.get(name).ok_or_else(|| McpError::UnknownProvider {
            name: name.to_string(),
        })?;

        let mut connections = self
            .connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let conn = connections.entry(name.to_string()).or_insert_with(|| {
            tracing::debug!(provider = name, "creating provider connection");
            Arc::new(ProviderConnection::new(
                name,
                entry.launcher.clone(),
                self.settings.clone(),
            ))
        });
        Ok(conn.clone())
    }

    /// Launch and handshake every provider concurrently and build the registry.
    pub async fn discover(&self) -> Discovery {
        let mut starts = Vec::new();
        for name in self.entries.keys() {
            let name = name.clone();
            let conn = self.connection(&name);
            starts.push(async move {
                let result = match conn {
                    Ok(conn) => conn.start().await,
                    Err(e) => Err(e),
                };
                (name, result)
            });
        }

        let mut registry = ToolRegistry::new();
        let mut failures = Vec::new();

        // join_all preserves input order, which is sorted by provider name.
        for (name, result) in futures::future::join_all(starts).await {
            match result {
                Ok(tools) => {
                    let class = self.entries.get(&name).map(|e| e.class).unwrap_or_default();
                    registry.register_provider_tools(&name, tools, class);
                }
                Err(e) => {
                    tracing::warn!(provider = %name, error = %e, "provider failed to start (non-fatal)");
                    failures.push((name, e));
                }
            }
        }

        tracing::info!(
            providers = self.entries.len(),
            failed = failures.len(),
            tools = registry.len(),
            "provider discovery complete"
        );

        Discovery { registry, failures }
    }

    /// Invoke `tools/call` on the provider that owns `tool_name`.
    pub async fn call_tool(
        &self,
        provider: &str,
        tool_name: &str,
        arguments: &serde_json::Value,
        timeout: Duration,
    ) -> Result<serde_json::Value, McpError> {
        let conn = self.connection(provider)?;
        let params = serde_json::json!({
            "name": tool_name,
            "arguments": arguments,
        });
        conn.call("tools/call", Some(params), timeout).await
    }

    /// Liveness of a provider, if its connection exists.
    pub fn liveness(&self, provider: &str) -> Option<Liveness> {
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(provider)
            .map(|c| c.liveness())
    }

    /// Liveness of every created connection, sorted by name.
    pub fn liveness_snapshot(&self) -> Vec<(String, Liveness)> {
        let connections = self
            .connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut snapshot: Vec<(String, Liveness)> = connections
            .iter()
            .map(|(name, c)| (name.clone(), c.liveness()))
            .collect();
        snapshot.sort_by(|a, b| a.0.cmp(&b.0));
        snapshot
    }

    /// Shut down every connection.
    pub async fn shutdown_all(&self) {
        let connections: Vec<Arc<ProviderConnection>> = {
            let mut map = self
                .connections
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            map.drain().map(|(_, c)| c).collect()
        };
        futures::future::join_all(connections.iter().map(|c| c.shutdown())).await;
        tracing::info!(count = connections.len(), "all providers shut down");
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
