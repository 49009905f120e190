//! Server process launching.
//!
//! A `ServerLauncher` turns a resolved launch request into a running process
//! plus the byte-stream pair used to talk to it. The production launcher
//! spawns a child process with piped stdio; tests plug in an in-memory one.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::transport::{BoxedReader, BoxedWriter};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Number of trailing stderr lines kept for failure diagnostics.
const STDERR_TAIL_LINES: usize = 40;

/// Maximum characters of stderr attached to an error message.
const STDERR_TAIL_CHARS: usize = 2000;

// ─── Launch Types ────────────────────────────────────────────────────────────

/// Everything needed to start one server, with env templates already resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<String>,
}

/// A freshly started server: its process handle and stream pair.
pub struct LaunchedServer {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    pub process: Box<dyn ServerProcess>,
}

/// Handle to a running server process.
#[async_trait]
pub trait ServerProcess: Send {
    /// OS process id, if there is one.
    fn id(&self) -> Option<u32>;

    /// Wait up to `grace` for the process to exit on its own, then kill it.
    async fn terminate(&mut self, grace: Duration) -> Result<(), McpError>;

    /// Recent diagnostic output (stderr), empty if none was captured.
    fn diagnostics(&self) -> String {
        String::new()
    }
}

/// Starts server processes.
pub trait ServerLauncher: Send + Sync {
    fn launch(&self, request: &LaunchRequest) -> Result<LaunchedServer, McpError>;
}

// ─── Process Launcher ────────────────────────────────────────────────────────

/// Spawns each server as an OS child process with JSON-RPC over stdio.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLauncher;

impl ServerLauncher for ProcessLauncher {
    fn launch(&self, request: &LaunchRequest) -> Result<LaunchedServer, McpError> {
        let mut cmd = Command::new(&request.command);
        cmd.args(&request.args);
        cmd.envs(request.env.iter().map(|(k, v)| (k, v)));

        if let Some(dir) = &request.cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        // Backstop for callers that drop the manager without cleanup
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| McpError::LaunchFailed {
            name: request.name.clone(),
            reason: format!("{}: {e}", request.command),
        })?;

        let stdin = child.stdin.take().ok_or_else(|| McpError::LaunchFailed {
            name: request.name.clone(),
            reason: "failed to capture stdin".into(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| McpError::LaunchFailed {
            name: request.name.clone(),
            reason: "failed to capture stdout".into(),
        })?;

        let stderr_tail = StderrTail::default();
        let stderr_pump = child
            .stderr
            .take()
            .map(|stderr| stderr_tail.pump(&request.name, stderr));

        tracing::info!(
            server = %request.name,
            command = %request.command,
            args = ?request.args,
            pid = child.id(),
            "spawned server process"
        );

        Ok(LaunchedServer {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            process: Box::new(ChildProcess {
                name: request.name.clone(),
                child,
                stderr_tail,
                stderr_pump,
            }),
        })
    }
}

// ─── Child Process ───────────────────────────────────────────────────────────

/// A `tokio::process::Child` plus its captured stderr.
struct ChildProcess {
    name: String,
    child: Child,
    stderr_tail: StderrTail,
    stderr_pump: Option<JoinHandle<()>>,
}

#[async_trait]
impl ServerProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn terminate(&mut self, grace: Duration) -> Result<(), McpError> {
        let result = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(server = %self.name, %status, "server process exited");
                Ok(())
            }
            _ => {
                // Force kill if graceful shutdown failed/timed out
                tracing::warn!(
                    server = %self.name,
                    grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX),
                    "server did not exit in time, killing"
                );
                self.child.kill().await.map_err(|e| McpError::TransportError {
                    server: self.name.clone(),
                    reason: format!("failed to kill process: {e}"),
                })
            }
        };

        if let Some(pump) = self.stderr_pump.take() {
            pump.abort();
        }
        result
    }

    fn diagnostics(&self) -> String {
        self.stderr_tail.snapshot()
    }
}

// ─── Stderr Capture ──────────────────────────────────────────────────────────

/// Ring buffer of a server's most recent stderr lines.
///
/// Draining stderr continuously also keeps a chatty server from blocking on
/// a full pipe.
#[derive(Debug, Clone, Default)]
struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl StderrTail {
    fn pump(&self, server: &str, stderr: ChildStderr) -> JoinHandle<()> {
        let tail = self.clone();
        let server = server.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(server = %server, "stderr: {line}");
                tail.push(line);
            }
        })
    }

    fn push(&self, line: String) {
        if let Ok(mut lines) = self.lines.lock() {
            if lines.len() == STDERR_TAIL_LINES {
                lines.pop_front();
            }
            lines.push_back(line);
        }
    }

    fn snapshot(&self) -> String {
        let joined = match self.lines.lock() {
            Ok(lines) => lines.iter().cloned().collect::<Vec<_>>().join("\n"),
            Err(_) => return String::new(),
        };
        truncate_diagnostics(joined)
    }
}

/// Keep the last `STDERR_TAIL_CHARS` characters, marking the cut.
fn truncate_diagnostics(text: String) -> String {
    let count = text.chars().count();
    if count <= STDERR_TAIL_CHARS {
        return text;
    }
    let tail: String = text.chars().skip(count - STDERR_TAIL_CHARS).collect();
    format!("(truncated)...{tail}")
}

/// Format a stderr suffix for error messages (empty string if no stderr).
pub fn format_stderr_suffix(stderr: &str) -> String {
    if stderr.trim().is_empty() {
        String::new()
    } else {
        format!(" | stderr: {}", stderr.trim())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
