//! Inference error types.
//!
//! Structured logging is the caller's responsibility; these types carry the
//! context needed to build meaningful log entries.

use thiserror::Error;

/// Errors that can occur during inference operations.
#[derive(Debug, Error)]
pub enum InferenceError {
    /// TCP/HTTP connection to the model endpoint failed.
    #[error("connection failed to {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    /// The model endpoint did not respond within the configured timeout.
    #[error("inference timeout after {duration_secs}s")]
    Timeout { duration_secs: u64 },

    /// Non-2xx HTTP response from the model endpoint.
    #[error("HTTP {status}: {body}")]
    HttpError { status: u16, body: String },

    /// The response carried no message content.
    #[error("empty response from model: {reason}")]
    EmptyResponse { reason: String },

    /// Configuration error (bad base URL, missing API key variable).
    #[error("config error: {reason}")]
    ConfigError { reason: String },
}

impl InferenceError {
    /// Whether a single retry is worthwhile.
    ///
    /// HTTP 404 is included because local servers answer 404 while a model is
    /// still loading; 500 because they answer 500 on transient decode errors.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            InferenceError::ConnectionFailed { .. }
                | InferenceError::Timeout { .. }
                | InferenceError::HttpError { status: 404, .. }
                | InferenceError::HttpError { status: 500, .. }
                | InferenceError::HttpError {
                    status: 502..=504,
                    ..
                }
        )
    }
}
