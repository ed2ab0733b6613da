//! Line-delimited JSON-RPC transport.
//!
//! One JSON object per line in each direction. A background reader task owns
//! the read half and routes every response to the request waiting on its
//! correlation id:
//! - Responses with an unknown (or already expired) id are dropped and logged.
//! - Non-JSON lines and provider notifications are ignored.
//! - When the read half closes, every pending request fails and the transport
//!   reports itself closed so the owning connection can treat it as a crash.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};
use crate::agent_core::tokens::truncate_utf8;

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Process-wide monotonic request id counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request id.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Pending Requests ────────────────────────────────────────────────────────

type PendingReply = Result<JsonRpcResponse, McpError>;
type PendingMap = Arc<StdMutex<HashMap<u64, oneshot::Sender<PendingReply>>>>;

/// Removes a request's pending slot when the waiting future finishes or is
/// dropped (timeout, cancellation). A response arriving afterwards finds no
/// slot and is discarded by the reader.
struct PendingGuard {
    pending: PendingMap,
    id: u64,
}

impl PendingGuard {
    fn register(pending: &PendingMap, id: u64, tx: oneshot::Sender<PendingReply>) -> Self {
        lock_pending(pending).insert(id, tx);
        Self {
            pending: pending.clone(),
            id,
        }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        lock_pending(&self.pending).remove(&self.id);
    }
}

fn lock_pending(
    pending: &PendingMap,
) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<PendingReply>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over any async byte stream pair
/// (child process stdio in production, in-memory pipes in tests).
pub struct JsonRpcTransport {
    provider: String,
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
    reader_task: JoinHandle<()>,
}

impl JsonRpcTransport {
    /// Create a transport and start its reader task.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new<R, W>(provider: &str, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        let reader_task = tokio::spawn(read_loop(
            provider.to_string(),
            BufReader::new(reader),
            pending.clone(),
            closed.clone(),
        ));

        Self {
            provider: provider.to_string(),
            writer: Mutex::new(Box::new(writer)),
            pending,
            closed,
            reader_task,
        }
    }

    /// Whether the provider side has closed the channel.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of requests still waiting for a response.
    #[cfg(test)]
    fn pending_count(&self) -> usize {
        lock_pending(&self.pending).len()
    }

    /// Send a request and wait up to `timeout` for the matching response.
    ///
    /// The timeout only bounds the client-side wait. The provider may still
    /// finish the work and reply later; that reply is discarded.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = next_request_id();
        let (tx, rx) = oneshot::channel();
        let _guard = PendingGuard::register(&self.pending, id, tx);

        // Checked after registering so a concurrent close cannot strand us.
        if self.is_closed() {
            return Err(self.closed_error());
        }

        self.write_line(&JsonRpcRequest::new(id, method, params))
            .await?;
        tracing::debug!(provider = %self.provider, id, method, "sent request");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) => {
                tracing::debug!(
                    provider = %self.provider,
                    id,
                    method,
                    timeout_ms = timeout.as_millis() as u64,
                    "request timed out, late response will be discarded"
                );
                Err(McpError::Timeout {
                    provider: self.provider.clone(),
                    method: method.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Send a notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        self.write_line(&JsonRpcNotification::new(method, params))
            .await
    }

    async fn write_line<T: Serialize>(&self, message: &T) -> Result<(), McpError> {
        let mut json = serde_json::to_string(message).map_err(|e| McpError::TransportError {
            provider: self.provider.clone(),
            reason: format!("failed to serialize message: {e}"),
        })?;
        json.push('\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| McpError::TransportError {
                provider: self.provider.clone(),
                reason: format!("failed to write to provider: {e}"),
            })?;
        writer.flush().await.map_err(|e| McpError::TransportError {
            provider: self.provider.clone(),
            reason: format!("failed to flush provider input: {e}"),
        })
    }

    fn closed_error(&self) -> McpError {
        McpError::TransportError {
            provider: self.provider.clone(),
            reason: "provider output closed (process may have exited)".into(),
        }
    }
}

impl Drop for JsonRpcTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

// ─── Reader Task ─────────────────────────────────────────────────────────────

async fn read_loop<R>(
    provider: String,
    reader: BufReader<R>,
    pending: PendingMap,
    closed: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => route_line(&provider, line.trim(), &pending),
            Ok(None) => {
                tracing::warn!(provider = %provider, "provider closed its output channel");
                break;
            }
            Err(e) => {
                tracing::warn!(provider = %provider, error = %e, "failed to read from provider");
                break;
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    // Dropping the senders wakes every waiter with a closed-channel error.
    lock_pending(&pending).clear();
}

/// Deliver one line to the request waiting on its id.
fn route_line(provider: &str, line: &str, pending: &PendingMap) {
    if line.is_empty() {
        return;
    }

    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => {
            tracing::debug!(
                provider,
                line = %truncate_utf8(line, 200),
                "ignoring non-JSON provider output"
            );
            return;
        }
    };

    if value.get("method").is_some() {
        tracing::debug!(provider, "ignoring provider-initiated message");
        return;
    }

    let id = match value.get("id") {
        None | Some(serde_json::Value::Null) => {
            tracing::debug!(provider, "ignoring message without correlation id");
            return;
        }
        Some(raw) => match raw.as_u64() {
            Some(id) => id,
            None => {
                tracing::warn!(provider, id = %raw, "dropping response with non-numeric id");
                return;
            }
        },
    };

    let Some(sender) = lock_pending(pending).remove(&id) else {
        tracing::warn!(provider, id, "dropping response with unknown or expired correlation id");
        return;
    };

    let reply = serde_json::from_value::<JsonRpcResponse>(value).map_err(|e| {
        McpError::MalformedResponse {
            provider: provider.to_string(),
            reason: format!("response {id} is not a JSON-RPC response: {e}"),
        }
    });
    let _ = sender.send(reply);
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(
    provider: &str,
    response: JsonRpcResponse,
) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or_else(|| McpError::MalformedResponse {
        provider: provider.to_string(),
        reason: "response missing both result and error".into(),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
