use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use futures::future::join_all;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

use crate::auth::{self, AuthProvider, OAuthFlowRegistry};
use crate::client::{ClientEvent, UpstreamClient};
use crate::config::{ReconnectSettings, TargetServerConfig, TransportConfig};
use crate::env_resolver::EnvResolver;
use crate::environment::Environment;
use crate::error::TransportError;
use crate::events::{self, EventEmitter, ListChangedSink};
use crate::reconnect::{AttemptFn, ReconnectionManager};
use crate::registry::{ToolDefinition, ToolRegistry};
use crate::transport::{DEFAULT_REQUEST_TIMEOUT, Transport, build_transport};

pub const TOOL_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Builds transports from configuration; injectable so tests can substitute
/// scripted upstreams.
pub trait TransportFactory: Send + Sync {
    fn build(
        &self,
        server_name: &str,
        config: &TransportConfig,
        resolved_env: HashMap<String, String>,
        auth: Option<Arc<dyn AuthProvider>>,
    ) -> Result<Box<dyn Transport>, TransportError>;
}

#[derive(Default, Clone)]
pub struct DefaultTransportFactory;

impl TransportFactory for DefaultTransportFactory {
    fn build(
        &self,
        server_name: &str,
        config: &TransportConfig,
        resolved_env: HashMap<String, String>,
        auth: Option<Arc<dyn AuthProvider>>,
    ) -> Result<Box<dyn Transport>, TransportError> {
        build_transport(server_name, config, resolved_env, auth)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ServerStatus {
    pub name: String,
    pub state: ServerState,
    pub last_error: Option<String>,
    pub connected_at: Option<String>,
}

struct ServerEntry {
    config: TargetServerConfig,
    state: ServerState,
    client: Option<Arc<UpstreamClient>>,
    reconnect: Arc<ReconnectionManager>,
    auth: Option<Arc<dyn AuthProvider>>,
    manual_disconnect: bool,
    last_error: Option<String>,
    connected_at: Option<chrono::DateTime<chrono::Utc>>,
    // bumped on every successful connect so stale monitors can't tear down
    // a newer connection
    epoch: u64,
}

/// Owns the per-server lifecycle: connect, discover, register, watch,
/// reconnect. The proxy reaches tools through it; it reaches the proxy only
/// through the narrow list-changed sink.
pub struct ConnectionManager {
    registry: Arc<ToolRegistry>,
    flows: Arc<OAuthFlowRegistry>,
    emitter: Arc<dyn EventEmitter>,
    environment: Arc<dyn Environment>,
    factory: Arc<dyn TransportFactory>,
    notifier: Arc<dyn ListChangedSink>,
    reconnect_settings: ReconnectSettings,
    servers: Mutex<HashMap<String, ServerEntry>>,
    manual_reconnections: Mutex<HashSet<String>>,
    discovery_timeout: Duration,
}

impl ConnectionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ToolRegistry>,
        flows: Arc<OAuthFlowRegistry>,
        emitter: Arc<dyn EventEmitter>,
        environment: Arc<dyn Environment>,
        factory: Arc<dyn TransportFactory>,
        notifier: Arc<dyn ListChangedSink>,
        reconnect_settings: ReconnectSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            flows,
            emitter,
            environment,
            factory,
            notifier,
            reconnect_settings,
            servers: Mutex::new(HashMap::new()),
            manual_reconnections: Mutex::new(HashSet::new()),
            discovery_timeout: TOOL_DISCOVERY_TIMEOUT,
        })
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    async fn add_server(self: &Arc<Self>, config: TargetServerConfig) {
        let name = config.name.clone();
        let reconnect = ReconnectionManager::new(self.reconnect_settings.clone());
        {
            let manager: Weak<ConnectionManager> = Arc::downgrade(self);
            let emitter = self.emitter.clone();
            let server = name.clone();
            reconnect.set_exhausted_callback(Box::new(move |attempts| {
                events::max_reconnection_attempts(emitter.as_ref(), &server, attempts);
                if let (Some(manager), Ok(handle)) =
                    (manager.upgrade(), tokio::runtime::Handle::try_current())
                {
                    let server = server.clone();
                    handle.spawn(async move { manager.mark_failed(&server).await });
                }
            }));
        }
        self.servers.lock().await.insert(
            name,
            ServerEntry {
                config,
                state: ServerState::Disconnected,
                client: None,
                reconnect,
                auth: None,
                manual_disconnect: false,
                last_error: None,
                connected_at: None,
                epoch: 0,
            },
        );
    }

    async fn mark_failed(&self, name: &str) {
        if let Some(entry) = self.servers.lock().await.get_mut(name) {
            entry.state = ServerState::Failed;
        }
    }

    /// Fan out over all configured servers. Individual failures are recorded,
    /// never fatal to the others.
    pub async fn connect_to_target_servers(self: &Arc<Self>, servers: Vec<TargetServerConfig>) {
        let mut names = Vec::new();
        for config in servers {
            let enabled = config.enabled;
            let name = config.name.clone();
            self.add_server(config).await;
            if enabled {
                names.push(name);
            } else {
                debug!(target = "client", server = %name, "server disabled, skipping connect");
            }
        }

        let outcomes = join_all(names.into_iter().map(|name| {
            let manager = self.clone();
            async move {
                let outcome = manager.connect_to_single_server(&name).await;
                (name, outcome)
            }
        }))
        .await;

        let mut connected = 0usize;
        let mut failed = 0usize;
        for (name, outcome) in outcomes {
            match outcome {
                Ok(()) => connected += 1,
                Err(err) => {
                    failed += 1;
                    warn!(target = "client", server = %name, error = %err, "initial connect failed");
                    if let Some(entry) = self.servers.lock().await.get_mut(&name) {
                        entry.last_error = Some(err.to_string());
                        entry.state = ServerState::Disconnected;
                    }
                }
            }
        }
        info!(target = "client", connected, failed, "target server fan-out complete");
    }

    /// Connect one server end to end: resolved env, auth provider, transport,
    /// MCP handshake, discovery, registration. `server.connected` is emitted
    /// only after the tools are registered.
    pub fn connect_to_single_server<'a>(
        self: &'a Arc<Self>,
        name: &'a str,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.connect_to_single_server_impl(name))
    }

    async fn connect_to_single_server_impl(self: &Arc<Self>, name: &str) -> Result<()> {
        let (config, auth) = {
            let mut servers = self.servers.lock().await;
            let entry = servers
                .get_mut(name)
                .ok_or_else(|| anyhow!("unknown server {name}"))?;
            if entry.client.is_some() {
                bail!("server {name} is already connected");
            }
            entry.state = ServerState::Connecting;
            entry.manual_disconnect = false;
            (entry.config.clone(), entry.auth.clone())
        };

        let resolver = EnvResolver::from_config(self.environment.as_ref(), &config.secret_providers);
        let resolved_env = resolver
            .resolve(&config)
            .with_context(|| format!("resolve env for {name}"))?;

        // the provider (and its token storage) outlives individual
        // transports so tokens survive reconnection
        let auth = match auth {
            Some(existing) => Some(existing),
            None => {
                let built = auth::build_provider(
                    name,
                    config.auth.as_ref(),
                    self.environment.as_ref(),
                    &self.flows,
                    self.emitter.clone(),
                )
                .with_context(|| format!("build auth provider for {name}"))?;
                if let Some(provider) = &built {
                    if let Some(entry) = self.servers.lock().await.get_mut(name) {
                        entry.auth = Some(provider.clone());
                    }
                }
                built
            }
        };

        let transport = self
            .factory
            .build(name, &config.transport, resolved_env, auth)
            .with_context(|| format!("build transport for {name}"))?;

        let (client, client_events) =
            UpstreamClient::connect(name, transport, DEFAULT_REQUEST_TIMEOUT)
                .await
                .with_context(|| format!("connect to {name}"))?;

        let mut tool_count = 0usize;
        match tokio::time::timeout(self.discovery_timeout, client.list_tools()).await {
            Ok(Ok(tools)) => {
                for value in &tools {
                    let Some(definition) = ToolDefinition::from_listing(value) else {
                        continue;
                    };
                    match self.registry.register_discovered_tool(name, definition) {
                        Ok(()) => tool_count += 1,
                        Err(err) => {
                            error!(target = "registry", server = %name, error = %err,
                                   "refusing conflicting tool registration");
                        }
                    }
                }
            }
            Ok(Err(err)) => {
                // the server stays connected with zero tools; a manual
                // rediscovery can pick them up later
                warn!(target = "client", server = %name, error = %err, "tool discovery failed");
            }
            Err(_) => {
                warn!(target = "client", server = %name, "tool discovery timed out");
            }
        }

        let epoch = {
            let mut servers = self.servers.lock().await;
            let entry = servers
                .get_mut(name)
                .ok_or_else(|| anyhow!("server {name} removed during connect"))?;
            entry.epoch += 1;
            entry.client = Some(client.clone());
            entry.state = ServerState::Connected;
            entry.connected_at = Some(chrono::Utc::now());
            entry.last_error = None;
            entry.reconnect.reset();
            entry.epoch
        };

        let manager = self.clone();
        let monitor_name = name.to_string();
        tokio::spawn(async move {
            manager.monitor(monitor_name, epoch, client_events).await;
        });

        info!(target = "client", server = %name, tools = tool_count, "connected");
        events::server_connected(self.emitter.as_ref(), name, tool_count);
        self.notifier.notify();
        Ok(())
    }

    async fn monitor(self: Arc<Self>, name: String, epoch: u64, mut events: mpsc::Receiver<ClientEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                ClientEvent::ToolListChanged => {
                    self.rediscover(&name).await;
                }
                ClientEvent::Disconnected { error } => {
                    self.handle_disconnect(&name, epoch, error).await;
                    return;
                }
            }
        }
    }

    /// Re-list the server's tools after an upstream `tools/list_changed` and
    /// replace its slice of the registry.
    async fn rediscover(&self, name: &str) {
        let client = match self.servers.lock().await.get(name).and_then(|e| e.client.clone()) {
            Some(client) => client,
            None => return,
        };
        let tools = match tokio::time::timeout(self.discovery_timeout, client.list_tools()).await {
            Ok(Ok(tools)) => tools,
            Ok(Err(err)) => {
                warn!(target = "client", server = %name, error = %err, "rediscovery failed");
                return;
            }
            Err(_) => {
                warn!(target = "client", server = %name, "rediscovery timed out");
                return;
            }
        };
        self.registry.remove_server_tools(name);
        let mut count = 0usize;
        for value in &tools {
            if let Some(definition) = ToolDefinition::from_listing(value)
                && self
                    .registry
                    .register_discovered_tool(name, definition)
                    .is_ok()
            {
                count += 1;
            }
        }
        info!(target = "client", server = %name, tools = count, "rediscovered tools");
        self.notifier.notify();
    }

    async fn handle_disconnect(
        self: &Arc<Self>,
        name: &str,
        epoch: u64,
        error: Option<TransportError>,
    ) {
        let (reason, schedule_auto) = {
            let mut servers = self.servers.lock().await;
            let Some(entry) = servers.get_mut(name) else {
                return;
            };
            if entry.epoch != epoch {
                debug!(target = "client", server = %name, "ignoring stale disconnect");
                return;
            }
            self.registry.remove_server_tools(name);
            entry.client = None;
            entry.connected_at = None;

            let retryable = error.as_ref().is_some_and(TransportError::is_retryable);
            let auto = self.reconnect_settings.enabled
                && entry.config.transport.reconnect_enabled()
                && !entry.manual_disconnect
                && retryable;

            let reason = if entry.manual_disconnect {
                "manual_disconnect".to_string()
            } else {
                match &error {
                    Some(err) => err.to_string(),
                    None => "closed".to_string(),
                }
            };
            entry.last_error = error.as_ref().map(|e| e.to_string());
            entry.state = if auto {
                ServerState::Reconnecting
            } else if error.as_ref().is_some_and(|e| !e.is_retryable()) {
                ServerState::Failed
            } else {
                ServerState::Disconnected
            };
            (reason, auto)
        };

        info!(target = "client", server = %name, reason = %reason, "disconnected");
        events::server_disconnected(self.emitter.as_ref(), name, &reason);
        self.notifier.notify();

        if schedule_auto {
            let reconnect = match self.servers.lock().await.get(name) {
                Some(entry) => entry.reconnect.clone(),
                None => return,
            };
            let manager = self.clone();
            let server = name.to_string();
            let emitter = self.emitter.clone();
            let tracker = reconnect.clone();
            let attempt: AttemptFn = Arc::new(move || {
                let manager = manager.clone();
                let server = server.clone();
                let emitter = emitter.clone();
                let attempt_number = tracker.attempts();
                Box::pin(async move {
                    events::server_reconnecting(emitter.as_ref(), &server, attempt_number);
                    manager.connect_to_single_server(&server).await
                })
            });
            reconnect.schedule_reconnection(attempt);
        }
    }

    /// Manual disconnect: cancels reconnection and closes the transport.
    /// Transport close errors are surfaced to the caller.
    pub async fn disconnect_server(&self, name: &str) -> Result<()> {
        let client = {
            let mut servers = self.servers.lock().await;
            let entry = servers
                .get_mut(name)
                .ok_or_else(|| anyhow!("unknown server {name}"))?;
            entry.manual_disconnect = true;
            entry.reconnect.cancel();
            entry.client.clone()
        };
        if let Some(client) = client {
            client
                .close()
                .await
                .with_context(|| format!("close transport for {name}"))?;
        }
        Ok(())
    }

    /// Manual reconnect. Rejected while connected; concurrent calls for the
    /// same server coalesce into one.
    pub async fn reconnect_server(self: &Arc<Self>, name: &str) -> Result<()> {
        {
            let servers = self.servers.lock().await;
            let entry = servers
                .get(name)
                .ok_or_else(|| anyhow!("unknown server {name}"))?;
            if entry.client.is_some() {
                bail!("server {name} is already connected");
            }
        }
        if !self.manual_reconnections.lock().await.insert(name.to_string()) {
            bail!("reconnect already in progress for {name}");
        }

        let result = async {
            if let Some(entry) = self.servers.lock().await.get_mut(name) {
                // a manual reconnect restores eligibility after `failed`
                entry.reconnect.reset();
                entry.manual_disconnect = false;
            }
            self.connect_to_single_server(name).await
        }
        .await;

        if let Err(err) = &result
            && let Some(entry) = self.servers.lock().await.get_mut(name)
        {
            entry.last_error = Some(err.to_string());
            entry.state = ServerState::Disconnected;
        }
        self.manual_reconnections.lock().await.remove(name);
        result
    }

    /// Best-effort reconnect of everything currently down; used after an
    /// OAuth flow completes.
    pub async fn reconnect_disconnected(self: &Arc<Self>) {
        let names: Vec<String> = {
            let servers = self.servers.lock().await;
            servers
                .iter()
                .filter(|(_, e)| {
                    e.config.enabled
                        && matches!(e.state, ServerState::Disconnected | ServerState::Failed)
                })
                .map(|(name, _)| name.clone())
                .collect()
        };
        for name in names {
            let manager = self.clone();
            tokio::spawn(async move {
                if let Err(err) = manager.reconnect_server(&name).await {
                    debug!(target = "client", server = %name, error = %err,
                           "post-authorization reconnect failed");
                }
            });
        }
    }

    /// Forward a tool call to the owning server's client.
    pub async fn call_tool(
        &self,
        server_name: &str,
        tool_name: &str,
        arguments: Option<Value>,
    ) -> Result<Value> {
        let client = self
            .servers
            .lock()
            .await
            .get(server_name)
            .and_then(|e| e.client.clone())
            .ok_or_else(|| anyhow!("server {server_name} is not connected"))?;
        client
            .call_tool(tool_name, arguments)
            .await
            .map_err(|err| anyhow!("{err}"))
    }

    pub async fn server_state(&self, name: &str) -> Option<ServerState> {
        self.servers.lock().await.get(name).map(|e| e.state)
    }

    pub async fn statuses(&self) -> Vec<ServerStatus> {
        let servers = self.servers.lock().await;
        let mut out: Vec<ServerStatus> = servers
            .values()
            .map(|entry| ServerStatus {
                name: entry.config.name.clone(),
                state: entry.state,
                last_error: entry.last_error.clone(),
                connected_at: entry.connected_at.map(|t| t.to_rfc3339()),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Close everything for process shutdown.
    pub async fn shutdown(&self) {
        let clients: Vec<(String, Arc<UpstreamClient>)> = {
            let mut servers = self.servers.lock().await;
            servers
                .iter_mut()
                .filter_map(|(name, entry)| {
                    entry.manual_disconnect = true;
                    entry.reconnect.cancel();
                    entry.client.take().map(|c| (name.clone(), c))
                })
                .collect()
        };
        for (name, client) in clients {
            if let Err(err) = client.close().await {
                warn!(target = "client", server = %name, error = %err, "close failed during shutdown");
            }
        }
    }
}
