use std::collections::HashMap;
use std::sync::RwLock;

use serde_json::Value;
use tracing::{debug, warn};
use wildmatch::WildMatch;

use crate::error::RegistryError;

/// Reserved server name for tools the proxy itself provides. Never removed
/// by upstream lifecycle churn.
pub const CORE_SERVER_NAME: &str = "switchboard";

/// Separator between the owning server and the tool's original name.
pub const TOOL_NAME_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolSource {
    Upstream,
    CoreTool,
    Command,
}

#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
}

impl ToolDefinition {
    /// Read a definition out of an upstream `tools/list` entry. Entries
    /// without a name are not tools.
    pub fn from_listing(value: &Value) -> Option<Self> {
        let name = value.get("name")?.as_str()?.to_string();
        let description = value
            .get("description")
            .and_then(|d| d.as_str())
            .map(|s| s.to_string());
        let input_schema = value
            .get("inputSchema")
            .or_else(|| value.get("input_schema"))
            .cloned()
            .unwrap_or_else(|| serde_json::json!({ "type": "object" }));
        Some(Self {
            name,
            description,
            input_schema,
        })
    }
}

#[derive(Debug, Clone)]
pub struct RegisteredTool {
    pub full_name: String,
    pub original_name: String,
    pub server_name: String,
    pub definition: ToolDefinition,
    pub source: ToolSource,
    pub enabled_dynamically: bool,
    pub enabled_by: Option<String>,
    pub discovered: bool,
}

pub fn full_tool_name(server_name: &str, tool_name: &str) -> String {
    format!("{server_name}{TOOL_NAME_SEPARATOR}{tool_name}")
}

/// The merged tool namespace. All mutation is serialized through this type;
/// names are unique across every source.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, RegisteredTool>>,
    expose_patterns: Option<Vec<String>>,
}

impl ToolRegistry {
    pub fn new(expose_patterns: Option<Vec<String>>) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            expose_patterns,
        }
    }

    /// Register a tool discovered on an upstream server. Re-registering the
    /// same `{full_name, server_name}` pair replaces the definition (the
    /// rediscovery path); the same name from anywhere else is rejected.
    pub fn register_discovered_tool(
        &self,
        server_name: &str,
        definition: ToolDefinition,
    ) -> Result<(), RegistryError> {
        let full_name = full_tool_name(server_name, &definition.name);
        self.insert(RegisteredTool {
            full_name,
            original_name: definition.name.clone(),
            server_name: server_name.to_string(),
            definition,
            source: ToolSource::Upstream,
            enabled_dynamically: false,
            enabled_by: None,
            discovered: true,
        })
    }

    /// Register a proxy-provided tool under its bare name.
    pub fn register_core_tool(&self, definition: ToolDefinition) -> Result<(), RegistryError> {
        self.insert(RegisteredTool {
            full_name: definition.name.clone(),
            original_name: definition.name.clone(),
            server_name: CORE_SERVER_NAME.to_string(),
            definition,
            source: ToolSource::CoreTool,
            enabled_dynamically: false,
            enabled_by: None,
            discovered: false,
        })
    }

    /// Register a command tool under its bare name.
    pub fn register_command_tool(&self, definition: ToolDefinition) -> Result<(), RegistryError> {
        self.insert(RegisteredTool {
            full_name: definition.name.clone(),
            original_name: definition.name.clone(),
            server_name: CORE_SERVER_NAME.to_string(),
            definition,
            source: ToolSource::Command,
            enabled_dynamically: false,
            enabled_by: None,
            discovered: false,
        })
    }

    fn insert(&self, tool: RegisteredTool) -> Result<(), RegistryError> {
        let mut tools = self.tools.write().unwrap();
        if let Some(existing) = tools.get(&tool.full_name) {
            let same_owner =
                existing.server_name == tool.server_name && existing.source == tool.source;
            if !same_owner {
                return Err(RegistryError::DuplicateTool(tool.full_name));
            }
            // rediscovery: replace the definition, keep dynamic enablement
            let mut replacement = tool;
            replacement.enabled_dynamically = existing.enabled_dynamically;
            replacement.enabled_by = existing.enabled_by.clone();
            tools.insert(replacement.full_name.clone(), replacement);
            return Ok(());
        }
        debug!(target = "registry", tool = %tool.full_name, "registered");
        tools.insert(tool.full_name.clone(), tool);
        Ok(())
    }

    /// Drop every upstream tool owned by `server_name`. Core and command
    /// tools survive even if the reserved name is passed.
    pub fn remove_server_tools(&self, server_name: &str) -> Vec<String> {
        let mut tools = self.tools.write().unwrap();
        let removed: Vec<String> = tools
            .values()
            .filter(|t| t.server_name == server_name && t.source == ToolSource::Upstream)
            .map(|t| t.full_name.clone())
            .collect();
        for name in &removed {
            tools.remove(name);
        }
        if !removed.is_empty() {
            debug!(target = "registry", server = %server_name, count = removed.len(),
                   "removed server tools");
        }
        removed
    }

    fn is_exposed(&self, tool: &RegisteredTool) -> bool {
        if tool.source != ToolSource::Upstream {
            return true;
        }
        if tool.enabled_dynamically {
            return true;
        }
        match &self.expose_patterns {
            None => true,
            Some(patterns) => patterns
                .iter()
                .any(|p| WildMatch::new(p).matches(&tool.full_name)),
        }
    }

    pub fn get_exposed_tools(&self) -> Vec<RegisteredTool> {
        let tools = self.tools.read().unwrap();
        let mut exposed: Vec<RegisteredTool> = tools
            .values()
            .filter(|t| self.is_exposed(t))
            .cloned()
            .collect();
        exposed.sort_by(|a, b| a.full_name.cmp(&b.full_name));
        exposed
    }

    pub fn get_all_tools(&self) -> Vec<RegisteredTool> {
        let tools = self.tools.read().unwrap();
        let mut all: Vec<RegisteredTool> = tools.values().cloned().collect();
        all.sort_by(|a, b| a.full_name.cmp(&b.full_name));
        all
    }

    /// Execution lookup is by exact full name and ignores the visibility
    /// filter: a dynamically enabled or directly addressed tool is callable
    /// even while hidden from `tools/list`.
    pub fn get_tool_for_execution(&self, full_name: &str) -> Option<RegisteredTool> {
        self.tools.read().unwrap().get(full_name).cloned()
    }

    /// Mark tools as dynamically enabled. Idempotent; returns the names whose
    /// state actually changed.
    pub fn enable_tools(&self, names: &[String], enabled_by: &str) -> Vec<String> {
        let mut tools = self.tools.write().unwrap();
        let mut changed = Vec::new();
        for name in names {
            match tools.get_mut(name) {
                Some(tool) => {
                    if !tool.enabled_dynamically {
                        tool.enabled_dynamically = true;
                        tool.enabled_by = Some(enabled_by.to_string());
                        changed.push(name.clone());
                    }
                }
                None => {
                    warn!(target = "registry", tool = %name, "enable requested for unknown tool");
                }
            }
        }
        changed
    }
}
