//! Protocol client error types.

use thiserror::Error;

/// Errors that can occur while talking to a tool provider.
#[derive(Debug, Error)]
pub enum McpError {
    /// A provider process failed to start.
    #[error("failed to spawn provider '{name}': {reason}")]
    SpawnFailed { name: String, reason: String },

    /// The capability handshake failed.
    #[error("provider '{name}' initialization failed: {reason}")]
    InitFailed { name: String, reason: String },

    /// I/O failure on the channel, or the provider closed it (crash).
    #[error("transport error for provider '{provider}': {reason}")]
    TransportError { provider: String, reason: String },

    /// Provider returned a JSON-RPC error response.
    #[error("provider error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// A response arrived for our id but could not be understood.
    #[error("malformed response from provider '{provider}': {reason}")]
    MalformedResponse { provider: String, reason: String },

    /// No response arrived within the call's timeout.
    #[error("'{method}' on provider '{provider}' timed out after {timeout_ms}ms")]
    Timeout {
        provider: String,
        method: String,
        timeout_ms: u64,
    },

    /// The provider has been marked permanently unavailable for this session.
    #[error("provider '{name}' is unavailable")]
    ProviderUnavailable { name: String },

    /// No provider with this name is configured.
    #[error("unknown provider: '{name}'")]
    UnknownProvider { name: String },

    /// Configuration error (bad provider entry, missing command).
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    /// The single automatic restart was already used up.
    #[error("provider '{name}' failed after {attempts} restart attempts")]
    RestartExhausted { name: String, attempts: u32 },
}

impl McpError {
    /// Whether this failure counts against the provider's liveness.
    ///
    /// A well-formed JSON-RPC error is a successful exchange at the protocol
    /// level and leaves the connection healthy.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            McpError::Timeout { .. }
                | McpError::MalformedResponse { .. }
                | McpError::TransportError { .. }
        )
    }
}
