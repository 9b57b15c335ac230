use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::config::CommandSettings;
use crate::registry::{ToolDefinition, ToolRegistry};

/// A locally implemented tool exposed alongside the aggregated catalog.
/// Commands declare their shape up front; the proxy never inspects them
/// structurally.
#[async_trait]
pub trait CommandTool: Send + Sync {
    fn name(&self) -> &str;
    fn definition(&self) -> ToolDefinition;
    async fn execute(&self, arguments: Value) -> anyhow::Result<Value>;
}

/// Holds the command tools admitted by configuration. Discovery of command
/// implementations is the caller's concern; the registry only gates and
/// dispatches them.
pub struct CommandRegistry {
    enabled: bool,
    allow_list: Option<Vec<String>>,
    commands: HashMap<String, Arc<dyn CommandTool>>,
}

impl CommandRegistry {
    pub fn new(settings: &CommandSettings) -> Self {
        Self {
            enabled: settings.enabled,
            allow_list: if settings.list.is_empty() {
                None
            } else {
                Some(settings.list.clone())
            },
            commands: HashMap::new(),
        }
    }

    /// Admit a command if configuration allows it. Returns whether it was
    /// registered.
    pub fn register(&mut self, command: Arc<dyn CommandTool>) -> bool {
        if !self.enabled {
            debug!(target = "commands", command = %command.name(), "commands disabled");
            return false;
        }
        if let Some(allow) = &self.allow_list
            && !allow.iter().any(|n| n == command.name())
        {
            debug!(target = "commands", command = %command.name(), "not in command list");
            return false;
        }
        self.commands.insert(command.name().to_string(), command);
        true
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CommandTool>> {
        self.commands.get(name).cloned()
    }

    /// Publish every admitted command into the tool registry.
    pub fn register_into(&self, registry: &ToolRegistry) {
        for command in self.commands.values() {
            if let Err(err) = registry.register_command_tool(command.definition()) {
                tracing::error!(target = "commands", command = %command.name(), error = %err,
                                "command tool collides with an existing name");
            }
        }
    }
}
