//! MCP Client error types.

use thiserror::Error;

/// Errors that can occur during MCP client operations.
#[derive(Debug, Error)]
pub enum McpError {
    /// The server configuration source is missing or malformed.
    #[error("config error: {reason}")]
    ConfigError { reason: String },

    /// No configuration exists for the named server.
    #[error("no configuration for server '{name}'")]
    UnknownServer { name: String },

    /// A server process failed to start.
    #[error("failed to launch server '{name}': {reason}")]
    LaunchFailed { name: String, reason: String },

    /// The initialization handshake failed.
    #[error("server '{name}' handshake failed: {reason}")]
    HandshakeFailed { name: String, reason: String },

    /// A bounded step (handshake attempt, discovery, connect, tool call) ran
    /// out of time.
    #[error("{operation} on server '{server}' timed out after {timeout_ms}ms")]
    Timeout {
        server: String,
        operation: String,
        timeout_ms: u64,
    },

    /// JSON-RPC communication error (I/O error, closed stream).
    #[error("transport error for server '{server}': {reason}")]
    TransportError { server: String, reason: String },

    /// A well-framed response whose payload does not have the expected shape.
    /// The stream itself is still usable.
    #[error("invalid {method} response from server '{server}': {reason}")]
    InvalidResponse {
        server: String,
        method: String,
        reason: String,
    },

    /// Server returned a JSON-RPC error response.
    #[error("server error [{code}]: {message}")]
    ServerError {
        code: i32,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// The target server is not in the `Connected` state.
    #[error("server '{name}' is not connected")]
    NotConnected { name: String },

    /// Tool not found in the aggregated catalog.
    #[error("tool not found: '{name}'")]
    ToolNotFound { name: String },
}

impl McpError {
    /// Whether this error means the underlying stream or process is gone.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, Self::TransportError { .. } | Self::Timeout { .. })
    }
}
