use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use rmcp::ErrorData as McpError;
use rmcp::model::{
    CallToolRequestParam, CallToolResult, Content, Implementation, InitializeRequestParam,
    InitializeResult, ListToolsResult, PaginatedRequestParam, ProtocolVersion, ServerCapabilities,
    ServerInfo, Tool,
};
use rmcp::service::RequestContext;
use rmcp::transport::streamable_http_server::{
    StreamableHttpServerConfig, StreamableHttpService, session::local::LocalSessionManager,
};
use rmcp::{Peer, RoleServer, ServerHandler, ServiceError};
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::auth::OAuthFlowRegistry;
use crate::commands::CommandRegistry;
use crate::connection::ConnectionManager;
use crate::error::AuthError;
use crate::events::ListChangedSink;
use crate::registry::{RegisteredTool, ToolDefinition, ToolRegistry, ToolSource};

pub const SERVER_NAME: &str = "MCP Switchboard";

const OAUTH_RECONNECT_DELAY: Duration = Duration::from_secs(1);

type PeerSet = Arc<RwLock<Vec<Peer<RoleServer>>>>;

/// Host-facing MCP server. Serves the aggregated catalog, dispatches calls
/// to core tools, command tools, or the owning upstream, and broadcasts
/// `notifications/tools/list_changed` to every live peer.
#[derive(Clone)]
pub struct SwitchboardService {
    registry: Arc<ToolRegistry>,
    connections: Arc<ConnectionManager>,
    flows: Arc<OAuthFlowRegistry>,
    commands: Arc<CommandRegistry>,
    peers: PeerSet,
}

/// Narrow handle the connection manager uses to trigger peer notification
/// without owning the proxy.
pub struct PeerNotifier {
    peers: PeerSet,
}

impl ListChangedSink for PeerNotifier {
    fn notify(&self) {
        let peers = self.peers.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move { notify_tool_list_changed(peers).await });
        }
    }
}

/// Notify any peers that tools have changed; drops unreachable peers.
async fn notify_tool_list_changed(peers: PeerSet) {
    let mut peers = peers.write().await;
    if peers.is_empty() {
        return;
    }
    debug!(target = "server", peers = peers.len(), "broadcasting tool list change");
    let mut retained = Vec::new();
    for peer in peers.iter() {
        if peer.is_transport_closed() {
            continue;
        }
        match peer.notify_tool_list_changed().await {
            Ok(()) => retained.push(peer.clone()),
            Err(ServiceError::TransportSend(_) | ServiceError::TransportClosed) => {
                debug!(target = "server", "dropping unreachable peer");
            }
            Err(err) => {
                warn!(target = "server", error = %err, "peer notification failed");
                retained.push(peer.clone());
            }
        }
    }
    *peers = retained;
}

pub const ENABLE_TOOLS_TOOL: &str = "enable_tools";
pub const DESCRIBE_TOOL_TOOL: &str = "describe_tool";

/// Register the proxy's own tools under the reserved server name.
pub fn register_core_tools(registry: &ToolRegistry) {
    let tools = [
        ToolDefinition {
            name: ENABLE_TOOLS_TOOL.into(),
            description: Some(
                "Expose tools that are hidden by the visibility filter. \
                 Takes effect immediately and notifies connected clients."
                    .into(),
            ),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "tools": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Full tool names to enable",
                    },
                },
                "required": ["tools"],
            }),
        },
        ToolDefinition {
            name: DESCRIBE_TOOL_TOOL.into(),
            description: Some("Return the full definition of a registered tool.".into()),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "name": { "type": "string", "description": "Full tool name" },
                },
                "required": ["name"],
            }),
        },
    ];
    for definition in tools {
        if let Err(err) = registry.register_core_tool(definition) {
            error!(target = "registry", error = %err, "core tool registration failed");
        }
    }
}

fn error_result(message: impl Into<String>) -> CallToolResult {
    CallToolResult {
        content: vec![Content::text(message.into())],
        structured_content: None,
        is_error: Some(true),
        meta: None,
    }
}

impl SwitchboardService {
    pub fn peer_set() -> PeerSet {
        Arc::new(RwLock::new(Vec::new()))
    }

    pub fn notifier(peers: &PeerSet) -> Arc<dyn ListChangedSink> {
        Arc::new(PeerNotifier {
            peers: peers.clone(),
        })
    }

    pub fn new(
        registry: Arc<ToolRegistry>,
        connections: Arc<ConnectionManager>,
        flows: Arc<OAuthFlowRegistry>,
        commands: Arc<CommandRegistry>,
        peers: PeerSet,
    ) -> Self {
        register_core_tools(&registry);
        commands.register_into(&registry);
        Self {
            registry,
            connections,
            flows,
            commands,
            peers,
        }
    }

    /// Relay an authorization callback into the flow registry. On success,
    /// servers that went down waiting for credentials get a reconnect nudge.
    pub async fn complete_oauth_flow(&self, state: &str, code: &str) -> Result<(), AuthError> {
        self.flows.complete(state, code).await?;
        info!(target = "oauth", "authorization flow completed");
        let connections = self.connections.clone();
        tokio::spawn(async move {
            tokio::time::sleep(OAUTH_RECONNECT_DELAY).await;
            connections.reconnect_disconnected().await;
        });
        Ok(())
    }

    fn to_wire_tool(tool: &RegisteredTool) -> Tool {
        let schema = tool
            .definition
            .input_schema
            .as_object()
            .cloned()
            .unwrap_or_default();
        Tool::new(
            tool.full_name.clone(),
            tool.definition.description.clone().unwrap_or_default(),
            schema,
        )
    }

    /// Route one tool call to a core tool, a command, or the owning
    /// upstream. Failures are always in-band `isError` results so a bad tool
    /// cannot poison the host session.
    pub async fn dispatch(&self, name: &str, arguments: Option<Value>) -> CallToolResult {
        let Some(tool) = self.registry.get_tool_for_execution(name) else {
            return error_result(format!("Tool not found: {name}"));
        };
        match tool.source {
            ToolSource::CoreTool => self.dispatch_core(&tool.original_name, arguments).await,
            ToolSource::Command => match self.commands.get(&tool.original_name) {
                Some(command) => {
                    match command.execute(arguments.unwrap_or_else(|| serde_json::json!({}))).await
                    {
                        Ok(value) => CallToolResult::success(vec![Content::text(
                            serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string()),
                        )]),
                        Err(err) => error_result(format!("error: {err}")),
                    }
                }
                None => error_result(format!("Tool not found: {name}")),
            },
            ToolSource::Upstream => {
                match self
                    .connections
                    .call_tool(&tool.server_name, &tool.original_name, arguments)
                    .await
                {
                    Ok(value) => serde_json::from_value::<CallToolResult>(value.clone())
                        .unwrap_or_else(|_| {
                            CallToolResult::success(vec![Content::text(value.to_string())])
                        }),
                    Err(err) => error_result(format!("error: {err}")),
                }
            }
        }
    }

    async fn dispatch_core(&self, name: &str, arguments: Option<Value>) -> CallToolResult {
        let arguments = arguments.unwrap_or_else(|| serde_json::json!({}));
        match name {
            ENABLE_TOOLS_TOOL => {
                let Some(names) = arguments.get("tools").and_then(|t| t.as_array()) else {
                    return error_result("enable_tools requires a `tools` array");
                };
                let names: Vec<String> = names
                    .iter()
                    .filter_map(|n| n.as_str().map(|s| s.to_string()))
                    .collect();
                let changed = self.registry.enable_tools(&names, "dynamic");
                if !changed.is_empty() {
                    notify_tool_list_changed(self.peers.clone()).await;
                }
                CallToolResult::success(vec![Content::text(format!(
                    "Enabled {} tool(s)",
                    changed.len()
                ))])
            }
            DESCRIBE_TOOL_TOOL => {
                let Some(target) = arguments.get("name").and_then(|n| n.as_str()) else {
                    return error_result("describe_tool requires a `name`");
                };
                match self.registry.get_tool_for_execution(target) {
                    Some(tool) => {
                        let description = serde_json::json!({
                            "name": tool.full_name,
                            "server": tool.server_name,
                            "description": tool.definition.description,
                            "inputSchema": tool.definition.input_schema,
                        });
                        CallToolResult::success(vec![Content::text(
                            serde_json::to_string_pretty(&description)
                                .unwrap_or_else(|_| description.to_string()),
                        )])
                    }
                    None => error_result(format!("Tool not found: {target}")),
                }
            }
            other => error_result(format!("Tool not found: {other}")),
        }
    }
}

impl ServerHandler for SwitchboardService {
    async fn initialize(
        &self,
        _request: InitializeRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<InitializeResult, McpError> {
        self.peers.write().await.push(context.peer);
        Ok(self.get_info())
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        let tools = self
            .registry
            .get_exposed_tools()
            .iter()
            .map(Self::to_wire_tool)
            .collect();
        Ok(ListToolsResult {
            tools,
            next_cursor: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let name = request.name.to_string();
        let arguments = request.arguments.map(Value::Object);
        Ok(self.dispatch(&name, arguments).await)
    }

    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2025_03_26,
            capabilities: ServerCapabilities::builder()
                .enable_logging()
                .enable_tools()
                .enable_tool_list_changed()
                .build(),
            server_info: Implementation {
                name: SERVER_NAME.into(),
                title: None,
                version: env!("CARGO_PKG_VERSION").into(),
                icons: None,
                website_url: None,
            },
            instructions: None,
        }
    }
}

/// Serve the proxy over Streamable HTTP on `addr`.
pub async fn start_http_server(
    service: SwitchboardService,
    addr: std::net::SocketAddr,
) -> anyhow::Result<(tokio::task::JoinHandle<()>, std::net::SocketAddr)> {
    let session_manager = Arc::new(LocalSessionManager::default());
    let http_service: StreamableHttpService<SwitchboardService, LocalSessionManager> =
        StreamableHttpService::new(
            move || Ok(service.clone()),
            session_manager,
            StreamableHttpServerConfig {
                stateful_mode: true,
                sse_keep_alive: Some(Duration::from_secs(15)),
            },
        );
    let router = Router::new().nest_service("/mcp", http_service);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    info!(target = "server", ip = %local.ip(), port = local.port(), "proxy_listening");
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    Ok((handle, local))
}

/// Serve the proxy over the process's own stdio until the host disconnects.
pub async fn serve_stdio(service: SwitchboardService) -> anyhow::Result<()> {
    info!(target = "server", "serving on stdio");
    let running =
        rmcp::service::serve_server(service, (tokio::io::stdin(), tokio::io::stdout())).await?;
    let _ = running.waiting().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandTool;
    use crate::config::{CommandSettings, ReconnectSettings};
    use crate::connection::DefaultTransportFactory;
    use crate::environment::MapEnvironment;
    use crate::events::BufferingEventEmitter;
    use async_trait::async_trait;

    fn first_text(result: &CallToolResult) -> String {
        result
            .content
            .iter()
            .find_map(|c| c.as_text().map(|t| t.text.clone()))
            .unwrap_or_default()
    }

    struct EchoCommand;

    #[async_trait]
    impl CommandTool for EchoCommand {
        fn name(&self) -> &str {
            "echo"
        }

        fn definition(&self) -> ToolDefinition {
            ToolDefinition {
                name: "echo".into(),
                description: None,
                input_schema: serde_json::json!({ "type": "object" }),
            }
        }

        async fn execute(&self, arguments: Value) -> anyhow::Result<Value> {
            Ok(arguments)
        }
    }

    fn service() -> SwitchboardService {
        let registry = Arc::new(ToolRegistry::new(Some(vec!["fs__*".into()])));
        let flows = OAuthFlowRegistry::new();
        let peers = SwitchboardService::peer_set();
        let connections = ConnectionManager::new(
            registry.clone(),
            flows.clone(),
            Arc::new(BufferingEventEmitter::default()),
            Arc::new(MapEnvironment::default()),
            Arc::new(DefaultTransportFactory),
            SwitchboardService::notifier(&peers),
            ReconnectSettings::default(),
        );
        let mut commands = CommandRegistry::new(&CommandSettings {
            enabled: true,
            list: vec![],
        });
        commands.register(Arc::new(EchoCommand));
        SwitchboardService::new(registry, connections, flows, Arc::new(commands), peers)
    }

    #[tokio::test]
    async fn unknown_tool_returns_in_band_error() {
        let service = service();
        let result = service.dispatch("nope", None).await;
        assert_eq!(result.is_error, Some(true));
        assert!(first_text(&result).contains("Tool not found: nope"));
    }

    #[tokio::test]
    async fn core_tools_are_exposed_and_callable() {
        let service = service();
        let exposed = service.registry.get_exposed_tools();
        assert!(exposed.iter().any(|t| t.full_name == ENABLE_TOOLS_TOOL));
        assert!(exposed.iter().any(|t| t.full_name == DESCRIBE_TOOL_TOOL));

        let described = service
            .dispatch(
                DESCRIBE_TOOL_TOOL,
                Some(serde_json::json!({"name": ENABLE_TOOLS_TOOL})),
            )
            .await;
        assert_ne!(described.is_error, Some(true));
        assert!(first_text(&described).contains("enable_tools"));
    }

    #[tokio::test]
    async fn enable_tools_reveals_hidden_tools() {
        let service = service();
        service
            .registry
            .register_discovered_tool(
                "gh",
                ToolDefinition {
                    name: "pulls".into(),
                    description: None,
                    input_schema: serde_json::json!({ "type": "object" }),
                },
            )
            .unwrap();
        assert!(
            !service
                .registry
                .get_exposed_tools()
                .iter()
                .any(|t| t.full_name == "gh__pulls")
        );

        let result = service
            .dispatch(
                ENABLE_TOOLS_TOOL,
                Some(serde_json::json!({"tools": ["gh__pulls"]})),
            )
            .await;
        assert_ne!(result.is_error, Some(true));
        assert!(
            service
                .registry
                .get_exposed_tools()
                .iter()
                .any(|t| t.full_name == "gh__pulls")
        );

        let missing_args = service.dispatch(ENABLE_TOOLS_TOOL, None).await;
        assert_eq!(missing_args.is_error, Some(true));
    }

    #[tokio::test]
    async fn command_tools_dispatch_locally() {
        let service = service();
        let result = service
            .dispatch("echo", Some(serde_json::json!({"x": 1})))
            .await;
        assert_ne!(result.is_error, Some(true));
        assert!(first_text(&result).contains("\"x\": 1"));
    }

    #[tokio::test]
    async fn upstream_tool_without_connection_errors_in_band() {
        let service = service();
        service
            .registry
            .register_discovered_tool(
                "fs",
                ToolDefinition {
                    name: "read".into(),
                    description: None,
                    input_schema: serde_json::json!({ "type": "object" }),
                },
            )
            .unwrap();
        let result = service.dispatch("fs__read", None).await;
        assert_eq!(result.is_error, Some(true));
        assert!(first_text(&result).contains("not connected"));
    }

    #[tokio::test]
    async fn oauth_completion_with_unknown_state_fails() {
        let service = service();
        let err = service.complete_oauth_flow("bogus", "code").await.unwrap_err();
        assert_eq!(err, AuthError::InvalidState);
    }
}
