//! Inference client: OpenAI-compatible API client for local LLM inference.
//!
//! The decision engine sees the model only through the [`ChatModel`] trait.
//! [`InferenceClient`] speaks the Chat Completions API with schema-constrained
//! output, so switching models is a config change, not a code change.

pub mod client;
pub mod errors;
pub mod types;

pub use client::{ChatModel, InferenceClient};
pub use errors::InferenceError;
pub use types::{ChatMessage, Role};
