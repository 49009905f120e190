//! Server manager: high-level interface for tool execution.
//!
//! Owns one `ServerConnection` per configured server, keeps the aggregated
//! `ToolCatalog` in step with them, and routes tool calls to the owning
//! server. This is the API the agent loop talks to.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use indexmap::IndexMap;

use super::catalog::ToolCatalog;
use super::config::{EnvProvider, ServerSpec, SystemEnv};
use super::connection::{ConnectionState, ServerConnection, ServerStatus};
use super::errors::McpError;
use super::launcher::{ProcessLauncher, ServerLauncher};
use super::policy::Timeouts;
use super::result::{adapt, InvocationResult};

// ─── ConnectSummary ──────────────────────────────────────────────────────────

/// Outcome of `connect_to_all`.
#[derive(Debug, Default)]
pub struct ConnectSummary {
    pub attempted: usize,
    pub connected: usize,
    /// Servers that failed to connect, in attempt order.
    pub failures: Vec<(String, McpError)>,
}

impl ConnectSummary {
    pub fn failed_servers(&self) -> Vec<&str> {
        self.failures.iter().map(|(name, _)| name.as_str()).collect()
    }
}

// ─── Builder ─────────────────────────────────────────────────────────────────

/// Configures the collaborators a `ServerManager` uses.
pub struct ServerManagerBuilder {
    specs: IndexMap<String, ServerSpec>,
    launcher: Arc<dyn ServerLauncher>,
    env: Arc<dyn EnvProvider>,
    timeouts: Timeouts,
}

impl ServerManagerBuilder {
    #[must_use]
    pub fn launcher(mut self, launcher: impl ServerLauncher + 'static) -> Self {
        self.launcher = Arc::new(launcher);
        self
    }

    #[must_use]
    pub fn env(mut self, env: impl EnvProvider + 'static) -> Self {
        self.env = Arc::new(env);
        self
    }

    #[must_use]
    pub fn timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn build(self) -> ServerManager {
        ServerManager {
            specs: self.specs,
            launcher: self.launcher,
            env: self.env,
            timeouts: self.timeouts,
            connections: Vec::new(),
            last_errors: HashMap::new(),
            catalog: ToolCatalog::new(),
        }
    }
}

// ─── ServerManager ───────────────────────────────────────────────────────────

/// Manages the set of tool-server connections and routes tool calls.
pub struct ServerManager {
    /// Configured servers, in connect order.
    specs: IndexMap<String, ServerSpec>,
    launcher: Arc<dyn ServerLauncher>,
    env: Arc<dyn EnvProvider>,
    timeouts: Timeouts,
    /// Registered connections in registration order. Names are unique.
    connections: Vec<ServerConnection>,
    /// Why the last connect attempt failed, for servers that are not registered.
    last_errors: HashMap<String, String>,
    catalog: ToolCatalog,
}

impl ServerManager {
    /// Manager that spawns real processes and reads the real environment.
    pub fn new(specs: IndexMap<String, ServerSpec>) -> Self {
        Self::builder(specs).build()
    }

    pub fn builder(specs: IndexMap<String, ServerSpec>) -> ServerManagerBuilder {
        ServerManagerBuilder {
            specs,
            launcher: Arc::new(ProcessLauncher::default()),
            env: Arc::new(SystemEnv),
            timeouts: Timeouts::default(),
        }
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────

    /// Connect every configured server, one at a time, and rebuild the catalog.
    ///
    /// Partial startup is fine: failures are collected in the summary and the
    /// failed servers are left unregistered with nothing running.
    pub async fn connect_to_all(&mut self) -> ConnectSummary {
        let specs: Vec<ServerSpec> = self.specs.values().cloned().collect();
        let mut summary = ConnectSummary::default();

        tracing::info!(count = specs.len(), "connecting to configured servers");

        for (i, spec) in specs.into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.timeouts.settle).await;
            }

            summary.attempted += 1;
            let name = spec.name.clone();
            match self.connect_spec(spec).await {
                Ok(()) => summary.connected += 1,
                Err(e) => {
                    tracing::warn!(server = %name, error = %e, "server failed to connect");
                    summary.failures.push((name, e));
                }
            }
        }

        self.rebuild_catalog();
        tracing::info!(
            attempted = summary.attempted,
            connected = summary.connected,
            failed = ?summary.failed_servers(),
            "{}",
            self.catalog.summary()
        );
        summary
    }

    /// Connect (or reconnect) a single configured server.
    pub async fn connect_server(&mut self, name: &str) -> Result<(), McpError> {
        let spec = self
            .specs
            .get(name)
            .cloned()
            .ok_or_else(|| McpError::UnknownServer {
                name: name.to_string(),
            })?;

        let result = self.connect_spec(spec).await;
        self.rebuild_catalog();
        result
    }

    /// Tear down and re-establish a server, replacing its tools.
    pub async fn reconnect_server(&mut self, name: &str) -> Result<(), McpError> {
        tracing::info!(server = %name, "reconnecting server");
        self.connect_server(name).await
    }

    /// Disconnect one server and drop its tools from the catalog.
    ///
    /// A no-op for a configured server that is not registered.
    pub async fn disconnect_server(&mut self, name: &str) -> Result<(), McpError> {
        match self.position(name) {
            Some(index) => {
                let mut connection = self.connections.remove(index);
                connection.disconnect().await;
                self.rebuild_catalog();
                Ok(())
            }
            None if self.specs.contains_key(name) => Ok(()),
            None => Err(McpError::UnknownServer {
                name: name.to_string(),
            }),
        }
    }

    /// Disconnect every connection in registration order. Idempotent.
    ///
    /// Each disconnect is independent; failures are logged by the connection
    /// and never stop the rest.
    pub async fn cleanup(&mut self) {
        if self.connections.is_empty() && self.catalog.is_empty() {
            return;
        }

        tracing::info!(count = self.connections.len(), "cleaning up server connections");
        for mut connection in self.connections.drain(..) {
            connection.disconnect().await;
        }
        self.catalog.clear();
        tracing::info!("all server connections closed");
    }

    /// Run `f` with this manager, then always clean up.
    ///
    /// ```ignore
    /// let n = manager
    ///     .scoped(|m| Box::pin(async move { m.connect_to_all().await.connected }))
    ///     .await;
    /// ```
    pub async fn scoped<T, F>(&mut self, f: F) -> T
    where
        F: for<'a> FnOnce(&'a mut ServerManager) -> BoxFuture<'a, T>,
    {
        let result = f(self).await;
        self.cleanup().await;
        result
    }

    /// Connect `spec`, replacing any registered connection of the same name.
    async fn connect_spec(&mut self, spec: ServerSpec) -> Result<(), McpError> {
        let name = spec.name.clone();

        let slot = match self.position(&name) {
            Some(index) => {
                let mut old = self.connections.remove(index);
                old.disconnect().await;
                Some(index)
            }
            None => None,
        };

        let mut connection = ServerConnection::new(spec, self.timeouts);
        match connection
            .connect(self.launcher.as_ref(), self.env.as_ref())
            .await
        {
            Ok(()) => {
                self.last_errors.remove(&name);
                match slot {
                    Some(index) => self.connections.insert(index, connection),
                    None => self.connections.push(connection),
                }
                Ok(())
            }
            Err(e) => {
                self.last_errors.insert(name, e.to_string());
                Err(e)
            }
        }
    }

    fn rebuild_catalog(&mut self) {
        self.catalog
            .rebuild(self.connections.iter().flat_map(|c| c.tools()));
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.connections.iter().position(|c| c.name() == name)
    }

    // ─── Tool Execution ──────────────────────────────────────────────────

    /// Route a tool call to its owning server and normalize the reply.
    ///
    /// A JSON-RPC error from the server is a failed invocation, not an error.
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
    ) -> Result<InvocationResult, McpError> {
        let server_name = self
            .catalog
            .server_for(tool_name)
            .ok_or_else(|| McpError::ToolNotFound {
                name: tool_name.to_string(),
            })?;

        let connection = self
            .connection(server_name)
            .filter(|c| c.is_connected())
            .ok_or_else(|| McpError::NotConnected {
                name: server_name.to_string(),
            })?;

        let start = Instant::now();
        let result = match connection.call_tool(tool_name, arguments).await {
            Ok(reply) => adapt(reply),
            Err(McpError::ServerError { code, message, .. }) => {
                InvocationResult::failure(Some(format!("[{code}] {message}")))
            }
            Err(e) => {
                tracing::warn!(server = %server_name, tool = %tool_name, error = %e, "tool call failed");
                return Err(e);
            }
        };

        tracing::info!(
            server = %server_name,
            tool = %tool_name,
            outcome = ?result.outcome,
            elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
            "tool call complete"
        );
        Ok(result)
    }

    // ─── Status ──────────────────────────────────────────────────────────

    pub fn catalog(&self) -> &ToolCatalog {
        &self.catalog
    }

    /// Tool list in the LLM function-calling shape.
    pub fn llm_tools(&self) -> Vec<serde_json::Value> {
        self.catalog.to_llm_tools()
    }

    pub fn connection(&self, name: &str) -> Option<&ServerConnection> {
        self.connections.iter().find(|c| c.name() == name)
    }

    /// Names of live connections, in registration order.
    pub fn connected_servers(&self) -> Vec<String> {
        self.connections
            .iter()
            .filter(|c| c.is_connected())
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Names of all configured servers (including those that failed to connect).
    pub fn configured_servers(&self) -> Vec<String> {
        self.specs.keys().cloned().collect()
    }

    pub fn connected_count(&self) -> usize {
        self.connections.iter().filter(|c| c.is_connected()).count()
    }

    pub fn tool_count(&self) -> usize {
        self.catalog.len()
    }

    pub fn tools_summary(&self) -> String {
        self.catalog.summary()
    }

    /// One status entry per configured server.
    pub fn statuses(&self) -> Vec<ServerStatus> {
        self.specs
            .keys()
            .map(|name| match self.connection(name) {
                Some(connection) => connection.status(),
                None => {
                    let error = self.last_errors.get(name).cloned();
                    ServerStatus {
                        name: name.clone(),
                        state: if error.is_some() {
                            ConnectionState::Failed
                        } else {
                            ConnectionState::Idle
                        },
                        tool_count: 0,
                        pid: None,
                        connected_at: None,
                        error,
                    }
                }
            })
            .collect()
    }
}

impl Drop for ServerManager {
    fn drop(&mut self) {
        let live = self.connections.iter().filter(|c| c.has_session()).count();
        if live > 0 {
            tracing::warn!(
                live,
                "server manager dropped without cleanup, killing remaining processes"
            );
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
