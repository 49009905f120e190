//! Server configuration loading.
//!
//! Reads the tool-server document (`configs/server_configs.json` by default)
//! into `ServerSpec`s keyed by server name, in document order. Loading fails soft: a missing or
//! malformed document yields an empty map plus a warning, because "no servers
//! configured" is a valid state for the orchestrator.
//!
//! Env values of the exact form `${NAME}` are templates resolved from the
//! process environment at connect time, not at load time.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::errors::McpError;
use super::launcher::LaunchRequest;

/// Default location of the server configuration document.
pub const DEFAULT_CONFIG_PATH: &str = "configs/server_configs.json";

/// Environment variable that overrides the config location.
pub const CONFIG_PATH_ENV: &str = "BRIEFBOT_SERVER_CONFIG";

// ─── ServerSpec ──────────────────────────────────────────────────────────────

/// Launch specification for one tool server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSpec {
    /// Filled from the mapping key, not from the entry body.
    #[serde(skip)]
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Values are either literals or `${VAR}` templates.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory for the process.
    #[serde(default)]
    pub cwd: Option<String>,
}

impl ServerSpec {
    pub fn new(name: &str, command: &str) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    /// Resolve env templates against `env`.
    ///
    /// `${NAME}` becomes the value of `NAME`; if `NAME` is unset the key is
    /// left out entirely. Anything else passes through literally.
    pub fn resolved_env(&self, env: &dyn EnvProvider) -> Vec<(String, String)> {
        self.env
            .iter()
            .filter_map(|(key, template)| match template_variable(template) {
                Some(var) => match env.get(var) {
                    Some(value) => Some((key.clone(), value)),
                    None => {
                        tracing::warn!(
                            server = %self.name,
                            key = %key,
                            variable = var,
                            "env variable unset, omitting from server environment"
                        );
                        None
                    }
                },
                None => Some((key.clone(), template.clone())),
            })
            .collect()
    }

    /// Build the launch request for this spec with env templates resolved.
    pub fn launch_request(&self, env: &dyn EnvProvider) -> LaunchRequest {
        LaunchRequest {
            name: self.name.clone(),
            command: self.command.clone(),
            args: self.args.clone(),
            env: self.resolved_env(env),
            cwd: self.cwd.clone(),
        }
    }
}

/// Return `NAME` if `value` is exactly `${NAME}`.
fn template_variable(value: &str) -> Option<&str> {
    value
        .strip_prefix("${")
        .and_then(|rest| rest.strip_suffix('}'))
        .filter(|name| !name.is_empty() && !name.contains(['{', '}', '$']))
}

// ─── Environment ─────────────────────────────────────────────────────────────

/// Source of environment variables (injectable for testing).
pub trait EnvProvider: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// Reads from the real process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl EnvProvider for SystemEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// Fixed set of variables.
#[derive(Debug, Clone, Default)]
pub struct StaticEnv {
    vars: HashMap<String, String>,
}

impl StaticEnv {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_var(mut self, key: &str, value: &str) -> Self {
        self.vars.insert(key.to_string(), value.to_string());
        self
    }
}

impl EnvProvider for StaticEnv {
    fn get(&self, key: &str) -> Option<String> {
        self.vars.get(key).cloned()
    }
}

// ─── Document Format ─────────────────────────────────────────────────────────

/// Syntax of a configuration document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
}

impl ConfigFormat {
    /// `.yaml`/`.yml` → YAML, anything else → JSON.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("yaml") || ext.eq_ignore_ascii_case("yml") => {
                Self::Yaml
            }
            _ => Self::Json,
        }
    }
}

/// Parse a configuration document into specs keyed by server name.
///
/// The server mapping may sit under `mcpServers` or `servers`, or be the
/// whole document. Specs keep the order the document lists them in, which is
/// the connect order. Entries with an empty command are skipped.
pub fn parse_servers(
    content: &str,
    format: ConfigFormat,
) -> Result<IndexMap<String, ServerSpec>, McpError> {
    let document: serde_json::Value = match format {
        ConfigFormat::Json => serde_json::from_str(content).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse JSON: {e}"),
        })?,
        ConfigFormat::Yaml => serde_yaml::from_str(content).map_err(|e| McpError::ConfigError {
            reason: format!("failed to parse YAML: {e}"),
        })?,
    };

    let servers = ["mcpServers", "servers"]
        .iter()
        .find_map(|key| document.get(*key).filter(|v| v.is_object()))
        .unwrap_or(&document);

    let raw: IndexMap<String, ServerSpec> = match servers {
        serde_json::Value::Null => IndexMap::new(),
        value => serde_json::from_value(value.clone()).map_err(|e| McpError::ConfigError {
            reason: format!("invalid server entry: {e}"),
        })?,
    };

    let mut specs = IndexMap::with_capacity(raw.len());
    for (name, mut spec) in raw {
        if spec.command.trim().is_empty() {
            tracing::warn!(server = %name, "server has an empty command, skipping");
            continue;
        }
        spec.name = name.clone();
        specs.insert(name, spec);
    }
    Ok(specs)
}

// ─── ServerConfigStore ───────────────────────────────────────────────────────

/// File-backed source of server specs.
#[derive(Debug, Clone)]
pub struct ServerConfigStore {
    path: PathBuf,
}

impl ServerConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `$BRIEFBOT_SERVER_CONFIG`, or the default path.
    pub fn from_env() -> Self {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
        Self::new(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load all specs, treating an unavailable source as empty.
    pub fn load(&self) -> IndexMap<String, ServerSpec> {
        match self.try_load() {
            Ok(specs) => {
                tracing::info!(
                    path = %self.path.display(),
                    count = specs.len(),
                    servers = ?specs.keys().collect::<Vec<_>>(),
                    "loaded server config"
                );
                specs
            }
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "server config unavailable, continuing with no servers"
                );
                IndexMap::new()
            }
        }
    }

    /// Load all specs, reporting why the source is unavailable.
    pub fn try_load(&self) -> Result<IndexMap<String, ServerSpec>, McpError> {
        let content =
            std::fs::read_to_string(&self.path).map_err(|e| McpError::ConfigError {
                reason: format!("failed to read {}: {e}", self.path.display()),
            })?;
        parse_servers(&content, ConfigFormat::from_path(&self.path))
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
