//! MCP Client: tool servers over stdio, aggregated for the agent loop.
//!
//! This module handles:
//! - Loading server launch specs from the config document
//! - Spawning each server and speaking JSON-RPC 2.0 over its stdio
//! - The per-server connection state machine (handshake retry, tool discovery,
//!   teardown)
//! - Aggregating discovered tools into one catalog and routing calls
//! - Normalizing tool replies into a success/failure result
//!
//! `ServerManager` is the entry point; everything else is a building block.

pub mod catalog;
pub mod config;
pub mod connection;
pub mod errors;
pub mod launcher;
pub mod manager;
pub mod policy;
pub mod result;
pub mod transport;
pub mod types;

#[cfg(test)]
mod testing;

// Re-exports for convenience
pub use catalog::ToolCatalog;
pub use config::{EnvProvider, ServerConfigStore, ServerSpec, StaticEnv, SystemEnv};
pub use connection::{ConnectionState, ServerConnection, ServerStatus};
pub use errors::McpError;
pub use launcher::{ProcessLauncher, ServerLauncher};
pub use manager::{ConnectSummary, ServerManager, ServerManagerBuilder};
pub use policy::{Deadline, RetryPolicy, Timeouts};
pub use result::{InvocationResult, Outcome};
pub use types::{ContentBlock, ToolDescriptor, ToolReply};
