//! Agent Core error types.
//!
//! Tool failures never appear here: they are folded into the conversation as
//! failed `ToolResult`s. Only conditions the loop cannot heal from are errors.

use thiserror::Error;

use crate::inference::InferenceError;
use crate::retrieval::RetrievalError;

/// Errors that can occur during agent core operations.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The model could not be reached, even after a retry. Fatal for the turn.
    #[error("model unreachable: {reason}")]
    ModelUnreachable { reason: String },

    /// Invalid configuration.
    #[error("config error: {reason}")]
    Config { reason: String },

    /// Document indexing or query failed.
    #[error("retrieval error: {reason}")]
    Retrieval { reason: String },

    /// Serialization error.
    #[error("serialization error: {reason}")]
    Serialization { reason: String },

    /// A background turn task panicked or was aborted.
    #[error("turn task failed: {reason}")]
    TaskFailed { reason: String },
}

impl From<InferenceError> for AgentError {
    fn from(e: InferenceError) -> Self {
        AgentError::ModelUnreachable {
            reason: e.to_string(),
        }
    }
}

impl From<RetrievalError> for AgentError {
    fn from(e: RetrievalError) -> Self {
        AgentError::Retrieval {
            reason: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(e: serde_json::Error) -> Self {
        AgentError::Serialization {
            reason: e.to_string(),
        }
    }
}

impl From<crate::config::ConfigError> for AgentError {
    fn from(e: crate::config::ConfigError) -> Self {
        AgentError::Config {
            reason: e.to_string(),
        }
    }
}
