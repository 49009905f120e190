//! Shared types for the MCP client.
//!
//! JSON-RPC 2.0 message types, MCP protocol structures, and the normalized
//! tool descriptor exposed to the LLM layer.

use serde::{Deserialize, Serialize};

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no `id`, no response expected).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
///
/// Server-to-client requests share the `id` field, so `method` is kept to
/// tell them apart from genuine responses.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub jsonrpc: String,
    pub id: u64,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// Protocol revision sent in the `initialize` request.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// MCP initialize response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(default, alias = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(default, alias = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// A tool entry as returned by `tools/list`, before normalization.
#[derive(Debug, Clone, Deserialize)]
pub struct RawToolDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default, alias = "inputSchema")]
    pub input_schema: Option<serde_json::Value>,
}

/// `tools/list` response payload.
///
/// Entries stay as raw JSON so one malformed tool can be skipped without
/// losing the rest of the page.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<serde_json::Value>,
    /// Opaque cursor for the next page, absent on the last one.
    #[serde(default, alias = "nextCursor")]
    pub next_cursor: Option<String>,
}

/// One fragment of a `tools/call` reply.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        #[serde(default)]
        data: String,
        #[serde(default, alias = "mimeType")]
        mime_type: String,
    },
    Resource {
        resource: serde_json::Value,
    },
    /// Any content type this client does not render (audio, resource links, …).
    #[serde(other)]
    Unsupported,
}

/// `tools/call` response payload.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ToolReply {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
    #[serde(default, alias = "isError")]
    pub is_error: bool,
}

// ─── Tool Descriptor ─────────────────────────────────────────────────────────

/// Kind of callable exposed to the model. Only functions exist today.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    #[default]
    Function,
}

/// A discovered tool, normalized for the catalog and the LLM layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ToolKind,
    pub description: String,
    pub parameters: serde_json::Value,
    /// Owning server name.
    pub server: String,
}

impl ToolDescriptor {
    /// Normalize a raw `tools/list` entry from `server`.
    ///
    /// Missing or blank descriptions fall back to `"Tool from <server> server"`;
    /// a missing or null schema becomes an empty object.
    pub fn from_raw(server: &str, raw: RawToolDefinition) -> Self {
        let description = raw
            .description
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| format!("Tool from {server} server"));

        let parameters = match raw.input_schema {
            Some(serde_json::Value::Null) | None => serde_json::json!({}),
            Some(schema) => schema,
        };

        Self {
            name: raw.name,
            kind: ToolKind::Function,
            description,
            parameters,
            server: server.to_string(),
        }
    }

    /// Render in the LLM function-calling shape
    /// `{name, type: "function", description, parameters}`.
    pub fn to_llm_tool(&self) -> serde_json::Value {
        serde_json::json!({
            "name": self.name,
            "type": self.kind,
            "description": self.description,
            "parameters": self.parameters,
        })
    }
}

// ─── Standard MCP Error Codes ────────────────────────────────────────────────

/// Well-known JSON-RPC error codes.
pub mod error_codes {
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

// ─── Tests ───────────────────────────────────────────────────────────────────
