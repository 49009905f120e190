//! In-memory tool servers for tests.
//!
//! `FakeLauncher` maps commands to scripted `FakeServer`s. Each launch wires a
//! `tokio::io::duplex` pair to a task that speaks line-delimited JSON-RPC, and
//! hands back a `FakeProcess` standing in for the OS process. The launcher
//! counts live processes so tests can assert nothing leaks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::launcher::{LaunchRequest, LaunchedServer, ServerLauncher, ServerProcess};
use super::policy::{RetryPolicy, Timeouts};

/// Timeouts short enough for tests, same shape as production.
pub(crate) fn quick_timeouts() -> Timeouts {
    Timeouts {
        connect: Duration::from_secs(2),
        handshake: RetryPolicy {
            max_attempts: 3,
            attempt_timeout: Duration::from_millis(200),
            backoff: Duration::from_millis(10),
        },
        discovery: Duration::from_millis(200),
        call: Duration::from_millis(300),
        shutdown: Duration::from_millis(100),
        settle: Duration::from_millis(1),
    }
}

// ─── Scripts ─────────────────────────────────────────────────────────────────

/// How the fake answers `initialize`.
#[derive(Debug, Clone, Copy)]
pub(crate) enum InitBehavior {
    Succeed,
    /// Error on the first `n` attempts, then succeed.
    FailTimes(usize),
    FailAlways,
    Hang,
}

/// How the fake answers `tools/list`.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ListBehavior {
    Succeed,
    Fail,
    /// Reply with a `tools` field that is not a list.
    Malformed,
    Hang,
}

/// How the fake answers `tools/call` for one tool.
#[derive(Debug, Clone)]
pub(crate) enum CallBehavior {
    /// Reply with a single text block `"<tool>:<arguments json>"`.
    Echo,
    /// Reply with this `result` value verbatim.
    Reply(Value),
    /// Reply with a JSON-RPC error.
    Error(i32, String),
    Hang,
    /// Close the stream, as a crashing process would.
    Exit,
}

/// A scripted tool server.
#[derive(Debug, Clone)]
pub(crate) struct FakeServer {
    tools: Vec<Value>,
    init: InitBehavior,
    list: ListBehavior,
    calls: HashMap<String, CallBehavior>,
}

impl FakeServer {
    /// A healthy server exposing the named tools, each echoing its arguments.
    pub(crate) fn with_tools(names: &[&str]) -> Self {
        Self {
            tools: names
                .iter()
                .map(|name| {
                    json!({
                        "name": name,
                        "description": format!("{name} tool"),
                        "inputSchema": {"type": "object", "properties": {}}
                    })
                })
                .collect(),
            init: InitBehavior::Succeed,
            list: ListBehavior::Succeed,
            calls: HashMap::new(),
        }
    }

    /// Replace the advertised tool entries with raw JSON.
    pub(crate) fn raw_tools(mut self, tools: Vec<Value>) -> Self {
        self.tools = tools;
        self
    }

    pub(crate) fn init(mut self, behavior: InitBehavior) -> Self {
        self.init = behavior;
        self
    }

    pub(crate) fn list(mut self, behavior: ListBehavior) -> Self {
        self.list = behavior;
        self
    }

    pub(crate) fn on_call(mut self, tool: &str, behavior: CallBehavior) -> Self {
        self.calls.insert(tool.to_string(), behavior);
        self
    }
}

// ─── Launcher ────────────────────────────────────────────────────────────────

/// Launcher backed by in-memory fake servers keyed by command.
#[derive(Clone, Default)]
pub(crate) struct FakeLauncher {
    servers: HashMap<String, FakeServer>,
    launches: Arc<Mutex<Vec<LaunchRequest>>>,
    live: Arc<AtomicUsize>,
    initialize_calls: Arc<AtomicUsize>,
    graces: Arc<Mutex<Vec<Duration>>>,
}

impl FakeLauncher {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_server(mut self, command: &str, server: FakeServer) -> Self {
        self.servers.insert(command.to_string(), server);
        self
    }

    /// Every launch request seen so far, in order.
    pub(crate) fn launches(&self) -> Vec<LaunchRequest> {
        self.launches.lock().unwrap().clone()
    }

    /// Names of launched servers, in launch order.
    pub(crate) fn launched_names(&self) -> Vec<String> {
        self.launches().into_iter().map(|r| r.name).collect()
    }

    /// Processes started and not yet terminated.
    pub(crate) fn live_processes(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// `initialize` requests received across all servers.
    pub(crate) fn initialize_calls(&self) -> usize {
        self.initialize_calls.load(Ordering::SeqCst)
    }

    /// Grace periods passed to `terminate`, in call order.
    pub(crate) fn terminate_graces(&self) -> Vec<Duration> {
        self.graces.lock().unwrap().clone()
    }
}

impl ServerLauncher for FakeLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<LaunchedServer, McpError> {
        self.launches.lock().unwrap().push(request.clone());

        let script = self
            .servers
            .get(&request.command)
            .cloned()
            .ok_or_else(|| McpError::LaunchFailed {
                name: request.name.clone(),
                reason: format!("{}: No such file or directory (os error 2)", request.command),
            })?;

        let (client, server) = tokio::io::duplex(64 * 1024);
        let (reader, writer) = tokio::io::split(client);
        let task = tokio::spawn(run_fake_server(
            server,
            script,
            self.initialize_calls.clone(),
        ));
        self.live.fetch_add(1, Ordering::SeqCst);

        Ok(LaunchedServer {
            reader: Box::new(reader),
            writer: Box::new(writer),
            process: Box::new(FakeProcess {
                task: Some(task),
                live: self.live.clone(),
                graces: self.graces.clone(),
            }),
        })
    }
}

/// Stand-in for an OS process: the task serving the fake's end of the duplex.
struct FakeProcess {
    task: Option<JoinHandle<()>>,
    live: Arc<AtomicUsize>,
    graces: Arc<Mutex<Vec<Duration>>>,
}

#[async_trait]
impl ServerProcess for FakeProcess {
    fn id(&self) -> Option<u32> {
        Some(4242)
    }

    async fn terminate(&mut self, grace: Duration) -> Result<(), McpError> {
        self.graces.lock().unwrap().push(grace);
        if let Some(task) = self.task.take() {
            task.abort();
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn diagnostics(&self) -> String {
        "fake server stderr".to_string()
    }
}

impl Drop for FakeProcess {
    // A dropped-but-unterminated process stays counted as live so leaks show
    // up in assertions; the task itself is stopped to keep tests from hanging.
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ─── Server Loop ─────────────────────────────────────────────────────────────

async fn run_fake_server(stream: DuplexStream, script: FakeServer, initialize_calls: Arc<AtomicUsize>) {
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut lines = BufReader::new(read_half).lines();
    let mut init_failures = 0;

    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(message) = serde_json::from_str::<Value>(&line) else {
            continue;
        };
        // Notifications get no reply
        let Some(id) = message.get("id").cloned() else {
            continue;
        };
        let method = message["method"].as_str().unwrap_or_default();

        let reply = match method {
            "initialize" => {
                initialize_calls.fetch_add(1, Ordering::SeqCst);
                match script.init {
                    InitBehavior::Succeed => Some(Ok(initialize_result())),
                    InitBehavior::FailTimes(n) if init_failures < n => {
                        init_failures += 1;
                        Some(Err((-32603, "still starting".to_string())))
                    }
                    InitBehavior::FailTimes(_) => Some(Ok(initialize_result())),
                    InitBehavior::FailAlways => Some(Err((-32603, "init exploded".to_string()))),
                    InitBehavior::Hang => None,
                }
            }
            "tools/list" => match script.list {
                ListBehavior::Succeed => Some(Ok(json!({"tools": script.tools}))),
                ListBehavior::Fail => Some(Err((-32601, "Method not found".to_string()))),
                ListBehavior::Malformed => Some(Ok(json!({"tools": "add, sub"}))),
                ListBehavior::Hang => None,
            },
            "tools/call" => {
                let tool = message["params"]["name"].as_str().unwrap_or_default();
                let arguments = message["params"]["arguments"].clone();
                match script.calls.get(tool).cloned().unwrap_or(CallBehavior::Echo) {
                    CallBehavior::Echo => Some(Ok(json!({
                        "content": [{"type": "text", "text": format!("{tool}:{arguments}")}],
                        "isError": false
                    }))),
                    CallBehavior::Reply(result) => Some(Ok(result)),
                    CallBehavior::Error(code, message) => Some(Err((code, message))),
                    CallBehavior::Hang => None,
                    CallBehavior::Exit => return,
                }
            }
            _ => Some(Err((-32601, "Method not found".to_string()))),
        };

        let Some(reply) = reply else {
            continue;
        };
        let response = match reply {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err((code, message)) => {
                json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
            }
        };

        let mut out = response.to_string();
        out.push('\n');
        if write_half.write_all(out.as_bytes()).await.is_err() {
            return;
        }
    }
}

fn initialize_result() -> Value {
    json!({
        "protocolVersion": "2024-11-05",
        "capabilities": {"tools": {}},
        "serverInfo": {"name": "fake", "version": "0.0.1"}
    })
}
