//! Dispatcher: routes a decided tool call to the provider that owns it.
//!
//! Every dispatch resolves to a [`ToolResult`]; nothing here returns `Err`.
//! In order:
//! 1. Unknown tool name: `UnknownTool`, with close matches as suggestions.
//!    Names are never auto-corrected.
//! 2. Arguments checked against the tool's parameter schema before any
//!    provider traffic: `InvalidArguments`.
//! 3. Policy: `PermissionDenied`.
//! 4. `tools/call` under the tool's timeout, racing the turn's cancel token.
//!
//! Each dispatch also appends a [`TranscriptEntry`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::config::ToolTimeouts;
use crate::mcp_client::{McpError, ProviderPool, RegisteredTool, ToolRegistry};

use super::fold::transcript_entry;
use super::policy::{ToolPermission, ToolPolicy};
use super::schema;
use super::tokens::truncate_utf8;
use super::types::{ToolErrorKind, ToolInvocation, ToolResult, TranscriptEntry};

/// How many close names to suggest for an unknown tool.
const MAX_SUGGESTIONS: usize = 3;

// ─── Dispatcher ─────────────────────────────────────────────────────────────

pub struct Dispatcher {
    pool: Arc<ProviderPool>,
    registry: Arc<ToolRegistry>,
    policy: ToolPolicy,
    timeouts: ToolTimeouts,
}

impl Dispatcher {
    pub fn new(
        pool: Arc<ProviderPool>,
        registry: Arc<ToolRegistry>,
        policy: ToolPolicy,
        timeouts: ToolTimeouts,
    ) -> Self {
        Self {
            pool,
            registry,
            policy,
            timeouts,
        }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<ProviderPool> {
        &self.pool
    }

    /// Timeout for a tool: the provider's override, else its class default.
    fn timeout_for(&self, tool: &RegisteredTool) -> Duration {
        self.pool
            .timeout_override(&tool.provider)
            .unwrap_or_else(|| self.timeouts.for_class(tool.class))
    }

    /// Dispatch one call and record it in `transcript`.
    pub async fn dispatch(
        &self,
        call: &ToolInvocation,
        transcript: &mut Vec<TranscriptEntry>,
        cancel: &CancellationToken,
    ) -> ToolResult {
        let result = self.execute(call, cancel).await;

        tracing::info!(
            tool = %call.tool_name,
            success = result.success,
            error_kind = ?result.error_kind,
            latency_ms = result.latency_ms,
            result_preview = %truncate_utf8(&result.output, 200),
            "tool dispatched"
        );

        transcript.push(transcript_entry(call, &result));
        result
    }

    async fn execute(&self, call: &ToolInvocation, cancel: &CancellationToken) -> ToolResult {
        let start = Instant::now();
        let name = call.tool_name.as_str();

        // 1. Resolve
        let Some(tool) = self.registry.get(name) else {
            return ToolResult::failure(
                name,
                ToolErrorKind::UnknownTool,
                self.unknown_tool_message(name),
                elapsed_ms(start),
            );
        };

        // 2. Validate
        if let Err(message) = validate_arguments(&call.arguments, &tool.descriptor) {
            return ToolResult::failure(
                name,
                ToolErrorKind::InvalidArguments,
                message,
                elapsed_ms(start),
            );
        }

        // 3. Policy
        if self.policy.check(name) == ToolPermission::Deny {
            return ToolResult::failure(
                name,
                ToolErrorKind::PermissionDenied,
                format!("Tool '{name}' is disabled by policy. Answer without it."),
                elapsed_ms(start),
            );
        }

        if cancel.is_cancelled() {
            return cancelled(name, start);
        }

        // 4. Execute
        let timeout = self.timeout_for(tool);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return cancelled(name, start),
            outcome = self.pool.call_tool(&tool.provider, name, &call.arguments, timeout) => outcome,
        };

        let latency = elapsed_ms(start);
        match outcome {
            Ok(value) => {
                let (text, is_error) = extract_tool_output(&value);
                if is_error {
                    ToolResult::failure(name, ToolErrorKind::ProviderError, text, latency)
                } else {
                    ToolResult::success(name, text, latency)
                }
            }
            Err(e) => {
                let kind = error_kind(&e);
                let message = match &e {
                    McpError::Timeout { timeout_ms, .. } => {
                        format!("Tool '{name}' timed out after {timeout_ms}ms.")
                    }
                    other => format!("Tool '{name}' failed: {other}"),
                };
                ToolResult::failure(name, kind, message, latency)
            }
        }
    }

    fn unknown_tool_message(&self, name: &str) -> String {
        let suggestions = self.registry.find_similar(name, MAX_SUGGESTIONS);
        let mut message = format!("Unknown tool '{name}'.");
        if !suggestions.is_empty() {
            message.push_str(&format!(" Did you mean: {}?", suggestions.join(", ")));
        }
        let available = self.registry.tool_names();
        if available.is_empty() {
            message.push_str(" No tools are available.");
        } else {
            message.push_str(&format!(" Available tools: {}.", available.join(", ")));
        }
        message
    }
}

// ─── Free Functions ─────────────────────────────────────────────────────────

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

fn cancelled(name: &str, start: Instant) -> ToolResult {
    ToolResult::failure(
        name,
        ToolErrorKind::Cancelled,
        "Cancelled before the tool finished.",
        elapsed_ms(start),
    )
}

/// Check arguments against a tool's parameter schema.
///
/// The error names the failing parameter and lists the required ones.
fn validate_arguments(
    arguments: &serde_json::Value,
    descriptor: &crate::mcp_client::ToolDescriptor,
) -> Result<(), String> {
    let violation = if !arguments.is_object() {
        schema::SchemaViolation::new(
            "",
            format!("arguments must be an object, got {}", schema::json_type_name(arguments)),
        )
    } else {
        match schema::validate(arguments, &descriptor.input_schema) {
            Ok(()) => return Ok(()),
            Err(v) => v,
        }
    };

    let required = descriptor.required_params();
    let required = if required.is_empty() {
        "none".to_string()
    } else {
        required.join(", ")
    };
    Err(format!(
        "Invalid arguments for '{}': {violation}. Required parameters: {required}. \
         Accepted parameters: {}.",
        descriptor.name,
        descriptor.param_names().join(", ")
    ))
}

fn error_kind(err: &McpError) -> ToolErrorKind {
    match err {
        McpError::Timeout { .. } => ToolErrorKind::Timeout,
        McpError::ProviderUnavailable { .. }
        | McpError::RestartExhausted { .. }
        | McpError::SpawnFailed { .. }
        | McpError::InitFailed { .. }
        | McpError::UnknownProvider { .. }
        | McpError::TransportError { .. } => ToolErrorKind::ProviderUnavailable,
        McpError::ServerError { .. }
        | McpError::MalformedResponse { .. }
        | McpError::ConfigError { .. } => ToolErrorKind::ProviderError,
    }
}

/// Readable text from a `tools/call` result, and whether it reports an error.
///
/// Results follow `{"content": [{"type": "text", "text": "..."}], "isError": bool}`.
/// Anything else is pretty-printed.
pub fn extract_tool_output(result: &serde_json::Value) -> (String, bool) {
    let is_error = result
        .get("isError")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    if let Some(blocks) = result.get("content").and_then(|c| c.as_array()) {
        let texts: Vec<&str> = blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect();
        if !texts.is_empty() {
            return (unwrap_result_json(&texts.join("\n")), is_error);
        }
        if blocks.is_empty() {
            return ("No result returned.".to_string(), is_error);
        }
    }

    if let Some(text) = result.as_str() {
        return (text.to_string(), is_error);
    }
    if result.is_null() {
        return ("No result returned.".to_string(), is_error);
    }

    let pretty = serde_json::to_string_pretty(result).unwrap_or_else(|_| result.to_string());
    (pretty, is_error)
}

/// Providers often serialize a result object into the text block. Pull the
/// primary text field out of it; otherwise return `raw` unchanged.
fn unwrap_result_json(raw: &str) -> String {
    let Ok(serde_json::Value::Object(obj)) = serde_json::from_str::<serde_json::Value>(raw) else {
        return raw.to_string();
    };

    for key in ["text", "content", "message", "result", "output"] {
        if let Some(val) = obj.get(key).and_then(|v| v.as_str()) {
            if !val.is_empty() {
                return val.to_string();
            }
        }
    }
    raw.to_string()
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp_client::{
        ConnectionSettings, JsonRpcTransport, LaunchedProvider, ProviderLauncher, ToolClass,
    };
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::HashMap;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    /// Advertises `fetch_webpage` and `slow_tool`; answers calls by name.
    struct WebLauncher;

    #[async_trait]
    impl ProviderLauncher for WebLauncher {
        async fn launch(&self, name: &str) -> Result<LaunchedProvider, McpError> {
            let (client, server) = tokio::io::duplex(64 * 1024);
            let (client_r, client_w) = tokio::io::split(client);
            let (server_r, server_w) = tokio::io::split(server);
            let server_w = Arc::new(tokio::sync::Mutex::new(server_w));
            tokio::spawn(async move {
                let mut lines = BufReader::new(server_r).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let req: serde_json::Value = serde_json::from_str(&line).unwrap();
                    if req.get("id").is_none() {
                        continue;
                    }
                    let writer = server_w.clone();
                    tokio::spawn(async move {
                        let result = match req["method"].as_str() {
                            Some("initialize") => json!({"tools": [
                                {
                                    "name": "fetch_webpage",
                                    "description": "Fetch a page",
                                    "inputSchema": {
                                        "type": "object",
                                        "properties": {"url": {"type": "string"}},
                                        "required": ["url"]
                                    }
                                },
                                {"name": "slow_tool", "inputSchema": {"type": "object"}},
                                {"name": "broken_tool", "inputSchema": {"type": "object"}}
                            ]}),
                            _ => match req["params"]["name"].as_str() {
                                Some("slow_tool") => {
                                    tokio::time::sleep(Duration::from_secs(5)).await;
                                    json!({"content": [{"type": "text", "text": "late"}]})
                                }
                                Some("broken_tool") => json!({
                                    "content": [{"type": "text", "text": "disk full"}],
                                    "isError": true
                                }),
                                _ => json!({"content": [{
                                    "type": "text",
                                    "text": format!("page body of {}", req["params"]["arguments"]["url"])
                                }]}),
                            },
                        };
                        let body = json!({"jsonrpc": "2.0", "id": req["id"], "result": result});
                        let _ = writer
                            .lock()
                            .await
                            .write_all(format!("{body}\n").as_bytes())
                            .await;
                    });
                }
            });
            Ok(LaunchedProvider {
                transport: JsonRpcTransport::new(name, client_r, client_w),
                process: None,
            })
        }
    }

    async fn dispatcher(policy: ToolPolicy) -> Dispatcher {
        let mut pool = ProviderPool::new(ConnectionSettings::default());
        pool.register(
            "web",
            Arc::new(WebLauncher),
            ToolClass::Network,
            Some(Duration::from_millis(200)),
        );
        let discovery = pool.discover().await;
        assert!(discovery.failures.is_empty());
        Dispatcher::new(
            Arc::new(pool),
            Arc::new(discovery.registry),
            policy,
            ToolTimeouts::default(),
        )
    }

    fn call(name: &str, arguments: serde_json::Value) -> ToolInvocation {
        ToolInvocation {
            tool_name: name.to_string(),
            arguments,
        }
    }

    #[tokio::test]
    async fn test_successful_dispatch_records_transcript() {
        let d = dispatcher(ToolPolicy::allow_all()).await;
        let mut transcript = Vec::new();
        let result = d
            .dispatch(
                &call("fetch_webpage", json!({"url": "https://example.com"})),
                &mut transcript,
                &CancellationToken::new(),
            )
            .await;
        assert!(result.success);
        assert_eq!(result.output, "page body of \"https://example.com\"");
        assert_eq!(transcript.len(), 1);
        assert!(transcript[0].success);
        assert_eq!(transcript[0].arguments["url"], "https://example.com");
    }

    #[tokio::test]
    async fn test_unknown_tool_suggests_without_correcting() {
        let d = dispatcher(ToolPolicy::allow_all()).await;
        let mut transcript = Vec::new();
        let result = d
            .dispatch(
                &call("fetch_webpag", json!({"url": "x"})),
                &mut transcript,
                &CancellationToken::new(),
            )
            .await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ToolErrorKind::UnknownTool));
        assert!(result.output.contains("Did you mean: fetch_webpage"));
        assert_eq!(transcript[0].tool_name, "fetch_webpag");
        assert_eq!(transcript[0].error_kind, Some(ToolErrorKind::UnknownTool));
    }

    #[tokio::test]
    async fn test_invalid_arguments_name_parameter_and_required_list() {
        let d = dispatcher(ToolPolicy::allow_all()).await;
        let mut transcript = Vec::new();
        let cancel = CancellationToken::new();

        let result = d
            .dispatch(&call("fetch_webpage", json!({"url": 7})), &mut transcript, &cancel)
            .await;
        assert_eq!(result.error_kind, Some(ToolErrorKind::InvalidArguments));
        assert!(result.output.contains("`url`: expected string, got integer"));
        assert!(result.output.contains("Required parameters: url."));

        let result = d
            .dispatch(&call("fetch_webpage", json!("url")), &mut transcript, &cancel)
            .await;
        assert!(result.output.contains("arguments must be an object"));
        assert_eq!(transcript.len(), 2);
    }

    #[tokio::test]
    async fn test_policy_denies_without_provider_call() {
        let rules: HashMap<String, ToolPermission> =
            [("fetch_webpage".to_string(), ToolPermission::Deny)].into();
        let d = dispatcher(ToolPolicy::from_rules(&rules)).await;
        let result = d
            .dispatch(
                &call("fetch_webpage", json!({"url": "x"})),
                &mut Vec::new(),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(result.error_kind, Some(ToolErrorKind::PermissionDenied));
    }

    #[tokio::test]
    async fn test_timeout_becomes_failed_result() {
        let d = dispatcher(ToolPolicy::allow_all()).await;
        let result = d
            .dispatch(&call("slow_tool", json!({})), &mut Vec::new(), &CancellationToken::new())
            .await;
        assert_eq!(result.error_kind, Some(ToolErrorKind::Timeout));
        assert!(result.output.contains("timed out after 200ms"));
    }

    #[tokio::test]
    async fn test_provider_reported_error() {
        let d = dispatcher(ToolPolicy::allow_all()).await;
        let result = d
            .dispatch(&call("broken_tool", json!({})), &mut Vec::new(), &CancellationToken::new())
            .await;
        assert_eq!(result.error_kind, Some(ToolErrorKind::ProviderError));
        assert_eq!(result.output, "disk full");
    }

    #[tokio::test]
    async fn test_cancel_interrupts_in_flight_call() {
        let d = dispatcher(ToolPolicy::allow_all()).await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let result = d
            .dispatch(&call("slow_tool", json!({})), &mut Vec::new(), &cancel)
            .await;
        assert_eq!(result.error_kind, Some(ToolErrorKind::Cancelled));
        assert!(result.latency_ms < 200);
    }

    #[tokio::test]
    async fn test_timeout_for_uses_override_then_class() {
        let d = dispatcher(ToolPolicy::allow_all()).await;
        let fetch = d.registry().get("fetch_webpage").unwrap();
        assert_eq!(d.timeout_for(fetch), Duration::from_millis(200));
    }

    #[test]
    fn test_extract_tool_output_shapes() {
        let (text, err) = extract_tool_output(&json!({"content": [
            {"type": "text", "text": "a"}, {"type": "text", "text": "b"}
        ]}));
        assert_eq!((text.as_str(), err), ("a\nb", false));

        let (text, _) = extract_tool_output(&json!({"content": [
            {"type": "text", "text": "{\"text\": \"inner\", \"score\": 1}"}
        ]}));
        assert_eq!(text, "inner");

        let (text, _) = extract_tool_output(&json!({"rows": 3}));
        assert!(text.contains("\"rows\": 3"));

        let (text, _) = extract_tool_output(&serde_json::Value::Null);
        assert_eq!(text, "No result returned.");
    }
}
