//! Tool catalog: aggregates tool descriptors across all connected servers.
//!
//! Provides:
//! - Tool lookup by name, and the owning server for a tool
//! - First-wins resolution when two servers expose the same tool name
//! - Serialization of tools into the LLM function-calling shape
//! - A one-line summary of which servers contribute which tools

use std::collections::HashMap;

use super::types::ToolDescriptor;

// ─── ToolCatalog ─────────────────────────────────────────────────────────────

/// Aggregated, queryable index of every tool from the live connections.
///
/// Tools are kept in registration order; `index` maps a name to the position
/// of the entry that won it.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    tools: Vec<ToolDescriptor>,
    index: HashMap<String, usize>,
}

impl ToolCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents with `tools`, in order.
    pub fn rebuild<'a, I>(&mut self, tools: I)
    where
        I: IntoIterator<Item = &'a ToolDescriptor>,
    {
        self.clear();
        for tool in tools {
            self.register(tool.clone());
        }
    }

    /// Add one tool. Returns `false` if the name was already taken, in which
    /// case the earlier entry is kept.
    pub fn register(&mut self, tool: ToolDescriptor) -> bool {
        if let Some(&existing) = self.index.get(&tool.name) {
            tracing::debug!(
                tool = %tool.name,
                server = %tool.server,
                kept = %self.tools[existing].server,
                "duplicate tool name, keeping first registration"
            );
            return false;
        }
        self.index.insert(tool.name.clone(), self.tools.len());
        self.tools.push(tool);
        true
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<&ToolDescriptor> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    /// Get the server name that owns a tool.
    pub fn server_for(&self, name: &str) -> Option<&str> {
        self.get(name).map(|t| t.server.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// All tools, in registration order.
    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn clear(&mut self) {
        self.tools.clear();
        self.index.clear();
    }

    /// Distinct owning servers, in the order they first contributed a tool.
    pub fn server_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for tool in &self.tools {
            if !names.contains(&tool.server.as_str()) {
                names.push(&tool.server);
            }
        }
        names
    }

    /// Count tools belonging to a specific server.
    pub fn tools_for_server(&self, server_name: &str) -> usize {
        self.tools.iter().filter(|t| t.server == server_name).count()
    }

    /// Tool list in the LLM shape `{name, type, description, parameters}`.
    pub fn to_llm_tools(&self) -> Vec<serde_json::Value> {
        self.tools.iter().map(ToolDescriptor::to_llm_tool).collect()
    }

    /// Human-readable summary, e.g. `"3 tools from 2 servers: math (2), news (1)"`.
    pub fn summary(&self) -> String {
        if self.is_empty() {
            return "No tools available.".to_string();
        }

        let servers = self.server_names();
        let server_parts: Vec<String> = servers
            .iter()
            .map(|name| format!("{name} ({})", self.tools_for_server(name)))
            .collect();

        format!(
            "{} tool{} from {} server{}: {}",
            self.len(),
            if self.len() == 1 { "" } else { "s" },
            servers.len(),
            if servers.len() == 1 { "" } else { "s" },
            server_parts.join(", ")
        )
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
