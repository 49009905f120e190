//! Line-delimited JSON-RPC transport.
//!
//! Handles low-level communication with an MCP server over a byte-stream pair
//! (a child's stdin/stdout in production, an in-memory duplex in tests):
//! - Writing JSON-RPC requests and notifications, one JSON object per line
//! - Reading lines until the response with the matching `id` arrives
//! - Closing the write half so the server sees EOF

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;

use super::errors::McpError;
use super::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// Read half of a server stream pair.
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Write half of a server stream pair.
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

// ─── Request ID Generator ────────────────────────────────────────────────────

/// Global monotonic request ID counter.
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Generate a unique request ID.
pub fn next_request_id() -> u64 {
    NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over one server's stream pair.
pub struct LineTransport {
    server_name: String,
    /// Held for a whole request/response exchange so concurrent callers never
    /// consume each other's responses.
    exchange: Mutex<()>,
    /// `None` once the transport has been closed.
    writer: Mutex<Option<BoxedWriter>>,
    reader: Mutex<BufReader<BoxedReader>>,
}

impl LineTransport {
    /// Create a new transport from a server's read/write halves.
    pub fn new(server_name: &str, reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            server_name: server_name.to_string(),
            exchange: Mutex::new(()),
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(BufReader::new(reader)),
        }
    }

    /// Send a JSON-RPC request and wait for the matching response.
    ///
    /// Lines that are not the response to this request (server logs,
    /// notifications, server-initiated requests, stale responses from an
    /// abandoned attempt) are skipped.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let _exchange = self.exchange.lock().await;

        let id = next_request_id();
        self.write_message(&JsonRpcRequest::new(id, method, params))
            .await?;

        let mut line_buf = String::new();
        let mut reader = self.reader.lock().await;

        loop {
            line_buf.clear();
            let bytes_read = reader
                .read_line(&mut line_buf)
                .await
                .map_err(|e| self.transport_error(format!("failed to read from server: {e}")))?;

            if bytes_read == 0 {
                return Err(self.transport_error(
                    "server output closed (process may have exited)".into(),
                ));
            }

            let trimmed = line_buf.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<JsonRpcResponse>(trimmed) {
                Ok(resp) if resp.id == id && resp.method.is_none() => return Ok(resp),
                Ok(resp) => {
                    tracing::trace!(
                        server = %self.server_name,
                        expected = id,
                        got = resp.id,
                        "skipping unrelated message"
                    );
                }
                Err(_) => {
                    tracing::trace!(
                        server = %self.server_name,
                        line = trimmed,
                        "skipping non-response line"
                    );
                }
            }
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let _exchange = self.exchange.lock().await;
        self.write_message(&JsonRpcNotification::new(method, params))
            .await
    }

    /// Shut down the write half so the server sees EOF on its input.
    ///
    /// Idempotent. The writer lock is only held during writes, but a write can
    /// stall on a full pipe, so acquiring it is bounded by `grace`.
    pub async fn close(&self, grace: Duration) -> Result<(), McpError> {
        let mut guard = tokio::time::timeout(grace, self.writer.lock())
            .await
            .map_err(|_| self.transport_error("timed out waiting to close stream".into()))?;

        let Some(mut writer) = guard.take() else {
            return Ok(());
        };

        match tokio::time::timeout(grace, writer.shutdown()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.transport_error(format!("failed to close stream: {e}"))),
            Err(_) => Err(self.transport_error("timed out closing stream".into())),
        }
    }

    /// Whether the write half is still open.
    pub async fn is_open(&self) -> bool {
        self.writer.lock().await.is_some()
    }

    async fn write_message<T: Serialize>(&self, message: &T) -> Result<(), McpError> {
        let mut json = serde_json::to_string(message)
            .map_err(|e| self.transport_error(format!("failed to serialize message: {e}")))?;
        json.push('\n');

        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| self.transport_error("stream closed".into()))?;

        writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| self.transport_error(format!("failed to write to server: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| self.transport_error(format!("failed to flush server input: {e}")))?;

        Ok(())
    }

    fn transport_error(&self, reason: String) -> McpError {
        McpError::TransportError {
            server: self.server_name.clone(),
            reason,
        }
    }
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: super::types::error_codes::INTERNAL_ERROR,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
