//! Per-server connection lifecycle.
//!
//! A `ServerConnection` owns one tool server from launch to teardown:
//!
//! ```text
//! Idle → Launching → Handshaking → ToolDiscovery → Connected → Disconnecting → Closed
//!   └──────────┴────────────┴──────────────┴────────────┴──→ Failed
//! ```
//!
//! The process handle and the stream pair live together in a `Session`, so
//! they are always present or absent as a pair. Teardown releases the stream
//! first, then the process, and never lets a failure in one step skip the other.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::config::{EnvProvider, ServerSpec};
use super::errors::McpError;
use super::launcher::{format_stderr_suffix, LaunchedServer, ServerLauncher, ServerProcess};
use super::policy::{Deadline, Timeouts};
use super::transport::{extract_result, LineTransport};
use super::types::{
    InitializeResult, ListToolsResult, RawToolDefinition, ToolDescriptor, ToolReply,
    PROTOCOL_VERSION,
};

/// Upper bound on `tools/list` pages followed per discovery.
const MAX_TOOL_PAGES: usize = 32;

/// Longest grace given to a session torn down after a call timeout or I/O
/// failure. A wedged server should not hold the caller past its own timeout.
const FAILED_SESSION_GRACE: Duration = Duration::from_millis(250);

// ─── ConnectionState ─────────────────────────────────────────────────────────

/// Lifecycle state of a `ServerConnection`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Launching,
    Handshaking,
    ToolDiscovery,
    Connected,
    Disconnecting,
    Closed,
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Launching => "launching",
            Self::Handshaking => "handshaking",
            Self::ToolDiscovery => "tool_discovery",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Closed => "closed",
            Self::Failed => "failed",
        };
        f.pad(s)
    }
}

// ─── Session ─────────────────────────────────────────────────────────────────

/// A live server: its transport and process handle, released together.
///
/// Shared via `Arc` so that in-flight tool calls keep their binding even if
/// the owning connection is torn down underneath them; such calls then fail
/// on the closed stream.
pub struct Session {
    server_name: String,
    transport: LineTransport,
    process: tokio::sync::Mutex<Option<Box<dyn ServerProcess>>>,
    pid: Option<u32>,
    closed: AtomicBool,
    failure: Mutex<Option<String>>,
}

impl Session {
    fn new(server_name: &str, launched: LaunchedServer) -> Self {
        let LaunchedServer {
            reader,
            writer,
            process,
        } = launched;
        Self {
            server_name: server_name.to_string(),
            transport: LineTransport::new(server_name, reader, writer),
            pid: process.id(),
            process: tokio::sync::Mutex::new(Some(process)),
            closed: AtomicBool::new(false),
            failure: Mutex::new(None),
        }
    }

    /// Whether the session has not been closed.
    pub fn is_alive(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Reason the session was torn down after an I/O failure, if any.
    pub fn failure(&self) -> Option<String> {
        self.failure.lock().ok().and_then(|f| f.clone())
    }

    /// Send `initialize` followed by `notifications/initialized`.
    async fn initialize(&self) -> Result<InitializeResult, McpError> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            },
        });

        let response = self.transport.request("initialize", Some(params)).await?;
        let result = extract_result(response)?;
        let init: InitializeResult =
            serde_json::from_value(result).map_err(|e| McpError::HandshakeFailed {
                name: self.server_name.clone(),
                reason: format!("failed to parse initialize response: {e}"),
            })?;

        self.transport
            .notify("notifications/initialized", None)
            .await?;

        Ok(init)
    }

    /// Fetch every page of `tools/list` and normalize the entries.
    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>, McpError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;

        for _ in 0..MAX_TOOL_PAGES {
            let params = cursor
                .as_ref()
                .map(|c| serde_json::json!({ "cursor": c }));
            let response = self.transport.request("tools/list", params).await?;
            let page: ListToolsResult = serde_json::from_value(extract_result(response)?)
                .map_err(|e| self.invalid_response("tools/list", &e))?;

            for entry in page.tools {
                match serde_json::from_value::<RawToolDefinition>(entry) {
                    Ok(raw) => tools.push(ToolDescriptor::from_raw(&self.server_name, raw)),
                    Err(e) => {
                        tracing::warn!(
                            server = %self.server_name,
                            error = %e,
                            "skipping malformed tool entry"
                        );
                    }
                }
            }

            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        Ok(tools)
    }

    async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolReply, McpError> {
        let params = serde_json::json!({
            "name": tool_name,
            "arguments": arguments,
        });
        let response = self.transport.request("tools/call", Some(params)).await?;
        serde_json::from_value(extract_result(response)?)
            .map_err(|e| self.invalid_response("tools/call", &e))
    }

    fn invalid_response(&self, method: &str, error: &serde_json::Error) -> McpError {
        McpError::InvalidResponse {
            server: self.server_name.clone(),
            method: method.to_string(),
            reason: error.to_string(),
        }
    }

    /// Recent stderr from the process, if it is still held.
    async fn diagnostics(&self) -> String {
        self.process
            .lock()
            .await
            .as_ref()
            .map(|p| p.diagnostics())
            .unwrap_or_default()
    }

    /// Record `error` as the reason for failure, then tear down with at most
    /// `FAILED_SESSION_GRACE` per step.
    async fn fail(&self, error: &McpError, grace: Duration) {
        if let Ok(mut failure) = self.failure.lock() {
            failure.get_or_insert_with(|| error.to_string());
        }
        self.close(grace.min(FAILED_SESSION_GRACE)).await;
    }

    /// Release the stream, then the process. Idempotent.
    ///
    /// Errors from either step are logged and swallowed. If this future is
    /// dropped midway, the process is killed when the session is dropped.
    pub async fn close(&self, grace: Duration) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Err(e) = self.transport.close(grace).await {
            tracing::warn!(server = %self.server_name, error = %e, "error closing stream");
        }

        let process = self.process.lock().await.take();
        if let Some(mut process) = process {
            if let Err(e) = process.terminate(grace).await {
                tracing::warn!(server = %self.server_name, error = %e, "error terminating process");
            }
        }
    }
}

// ─── ServerStatus ────────────────────────────────────────────────────────────

/// Point-in-time status of one server, for status reporting.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatus {
    pub name: String,
    pub state: ConnectionState,
    pub tool_count: usize,
    pub pid: Option<u32>,
    pub connected_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

// ─── ServerConnection ────────────────────────────────────────────────────────

/// One tool server's connection, exclusively owned by the manager.
pub struct ServerConnection {
    spec: ServerSpec,
    timeouts: Timeouts,
    state: ConnectionState,
    session: Option<Arc<Session>>,
    tools: Vec<ToolDescriptor>,
    last_error: Option<String>,
    connected_at: Option<DateTime<Utc>>,
}

impl ServerConnection {
    pub fn new(spec: ServerSpec, timeouts: Timeouts) -> Self {
        Self {
            spec,
            timeouts,
            state: ConnectionState::Idle,
            session: None,
            tools: Vec::new(),
            last_error: None,
            connected_at: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &ServerSpec {
        &self.spec
    }

    /// Current state. A connection whose session died after an I/O failure
    /// or call timeout reports `Failed`.
    pub fn state(&self) -> ConnectionState {
        match (&self.session, self.state) {
            (Some(session), ConnectionState::Connected) if !session.is_alive() => {
                ConnectionState::Failed
            }
            (_, state) => state,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Tools discovered on the last successful connect.
    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .clone()
            .or_else(|| self.session.as_ref().and_then(|s| s.failure()))
    }

    /// Whether a process/stream pair is currently held.
    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn status(&self) -> ServerStatus {
        ServerStatus {
            name: self.name().to_string(),
            state: self.state(),
            tool_count: self.tools.len(),
            pid: self.session.as_ref().and_then(|s| s.pid()),
            connected_at: self.connected_at,
            error: self.last_error(),
        }
    }

    // ─── Connect ─────────────────────────────────────────────────────────

    /// Launch, handshake, and discover tools, all within the connect timeout.
    ///
    /// On failure the connection is torn down and left `Failed`. Calling this
    /// on a connection that already holds a session replaces it.
    pub async fn connect(
        &mut self,
        launcher: &dyn ServerLauncher,
        env: &dyn EnvProvider,
    ) -> Result<(), McpError> {
        if self.session.is_some() {
            self.disconnect().await;
        }
        self.tools.clear();
        self.last_error = None;
        self.connected_at = None;

        tracing::info!(
            server = %self.spec.name,
            command = %self.spec.command,
            args = ?self.spec.args,
            "connecting to server"
        );

        let started = Instant::now();
        let deadline = Deadline::after(self.timeouts.connect);

        match self.establish(launcher, env, &deadline).await {
            Ok(()) => {
                tracing::info!(
                    server = %self.spec.name,
                    tools = self.tools.len(),
                    elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
                    "connected to server"
                );
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    server = %self.spec.name,
                    state = %self.state,
                    error = %e,
                    "connection failed"
                );
                self.last_error = Some(e.to_string());
                self.teardown(ConnectionState::Failed).await;
                Err(e)
            }
        }
    }

    async fn establish(
        &mut self,
        launcher: &dyn ServerLauncher,
        env: &dyn EnvProvider,
        deadline: &Deadline,
    ) -> Result<(), McpError> {
        // Launching
        self.state = ConnectionState::Launching;
        let request = self.spec.launch_request(env);
        let launched = launcher.launch(&request)?;
        let session = Arc::new(Session::new(&self.spec.name, launched));
        self.session = Some(session.clone());

        // Handshaking
        self.state = ConnectionState::Handshaking;
        let handshake = self
            .timeouts
            .handshake
            .run(deadline, &self.spec.name, "initialize", |_| session.initialize())
            .await;

        match handshake {
            Ok(init) => {
                tracing::debug!(
                    server = %self.spec.name,
                    protocol = ?init.protocol_version,
                    server_info = ?init.server_info.as_ref().and_then(|i| i.name.as_deref()),
                    "handshake complete"
                );
            }
            Err(e) => return Err(self.handshake_error(&session, e).await),
        }

        // ToolDiscovery
        self.state = ConnectionState::ToolDiscovery;
        let discovery = deadline
            .run(
                &self.spec.name,
                "tools/list",
                self.timeouts.discovery,
                session.list_tools(),
            )
            .await;

        match discovery {
            Ok(tools) => self.tools = tools,
            Err(e) if deadline.is_expired() || matches!(e, McpError::TransportError { .. }) => {
                return Err(e);
            }
            Err(e) => {
                tracing::warn!(
                    server = %self.spec.name,
                    error = %e,
                    "tool discovery failed, continuing with no tools"
                );
            }
        }

        self.state = ConnectionState::Connected;
        self.connected_at = Some(Utc::now());
        Ok(())
    }

    /// Attach captured stderr to a handshake failure.
    async fn handshake_error(&self, session: &Session, error: McpError) -> McpError {
        let stderr = session.diagnostics().await;
        if !stderr.trim().is_empty() {
            tracing::warn!(
                server = %self.spec.name,
                stderr = %stderr,
                "server stderr captured on handshake failure"
            );
        }

        match error {
            McpError::Timeout { .. } => error,
            other => McpError::HandshakeFailed {
                name: self.spec.name.clone(),
                reason: format!("{other}{}", format_stderr_suffix(&stderr)),
            },
        }
    }

    // ─── Disconnect ──────────────────────────────────────────────────────

    /// Tear down the session. A no-op if nothing is held.
    pub async fn disconnect(&mut self) {
        if self.session.is_none() {
            return;
        }

        tracing::info!(server = %self.spec.name, "disconnecting server");
        let final_state = match self.state() {
            ConnectionState::Failed => ConnectionState::Failed,
            _ => ConnectionState::Closed,
        };
        self.teardown(final_state).await;
        tracing::info!(server = %self.spec.name, state = %self.state, "server disconnected");
    }

    async fn teardown(&mut self, final_state: ConnectionState) {
        if let Some(session) = self.session.take() {
            if final_state == ConnectionState::Closed {
                self.state = ConnectionState::Disconnecting;
            }
            if let Some(failure) = session.failure() {
                self.last_error.get_or_insert(failure);
            }
            session.close(self.timeouts.shutdown).await;
        }
        self.tools.clear();
        self.connected_at = None;
        self.state = final_state;
    }

    // ─── Tool Calls ──────────────────────────────────────────────────────

    /// Forward a tool call to this server and return its raw reply.
    ///
    /// Not retried. A timeout or broken stream tears the session down and the
    /// connection reports `Failed` from then on. A reply that arrives but does
    /// not parse leaves the session alone.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<ToolReply, McpError> {
        let session = match &self.session {
            Some(session) if self.is_connected() => session.clone(),
            _ => {
                return Err(McpError::NotConnected {
                    name: self.spec.name.clone(),
                })
            }
        };

        let arguments = if arguments.is_null() {
            serde_json::json!({})
        } else {
            arguments
        };

        let call_timeout = self.timeouts.call;
        match tokio::time::timeout(call_timeout, session.call_tool(tool_name, arguments)).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(e)) => {
                if e.is_transport_failure() {
                    session.fail(&e, self.timeouts.shutdown).await;
                }
                Err(e)
            }
            Err(_) => {
                let e = McpError::Timeout {
                    server: self.spec.name.clone(),
                    operation: format!("tools/call '{tool_name}'"),
                    timeout_ms: u64::try_from(call_timeout.as_millis()).unwrap_or(u64::MAX),
                };
                session.fail(&e, self.timeouts.shutdown).await;
                Err(e)
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
