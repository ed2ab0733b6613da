//! Tool protocol client: JSON-RPC 2.0 over a provider's stdio.
//!
//! This module handles:
//! - Launching provider processes and the capability handshake
//! - Request/response correlation over a line-delimited channel
//! - Per-provider liveness (starting, ready, degraded, terminated) and the
//!   single automatic restart
//! - Aggregating advertised tools into a registry
//!
//! The dispatcher reaches providers only through [`ProviderPool`].

pub mod connection;
pub mod errors;
pub mod lifecycle;
pub mod pool;
pub mod registry;
pub mod transport;
pub mod types;

pub use connection::{ConnectionSettings, Liveness, ProviderConnection};
pub use errors::McpError;
pub use lifecycle::{LaunchedProvider, ProcessLauncher, ProviderLauncher};
pub use pool::{Discovery, ProviderPool};
pub use registry::{RegisteredTool, ToolRegistry};
pub use transport::JsonRpcTransport;
pub use types::{ProviderConfig, ToolClass, ToolDescriptor};
