use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use mcp_switchboard::commands::CommandRegistry;
use mcp_switchboard::config::{
    ConfigProvider, HostTransport, OsConfigProvider, load_settings_with,
};
use mcp_switchboard::connection::{ConnectionManager, DefaultTransportFactory};
use mcp_switchboard::environment::{Environment, OsEnvironment};
use mcp_switchboard::events::{EventEmitter, LogEventEmitter};
use mcp_switchboard::auth::OAuthFlowRegistry;
use mcp_switchboard::proxy::{self, SwitchboardService};
use mcp_switchboard::registry::ToolRegistry;

struct DirConfigProvider(PathBuf);

impl ConfigProvider for DirConfigProvider {
    fn base_dir(&self) -> PathBuf {
        self.0.clone()
    }
}

fn config_dir_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Structured logging via tracing with env filter; stderr keeps stdout
    // clean for the stdio host transport. Configure via RUST_LOG, e.g.
    // RUST_LOG=info,mcp_switchboard=debug
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new("info,mcp_switchboard=debug"))
        .unwrap();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();

    let settings = match config_dir_from_args() {
        Some(dir) => load_settings_with(&DirConfigProvider(dir)),
        None => load_settings_with(&OsConfigProvider),
    };

    let registry = Arc::new(ToolRegistry::new(settings.expose_tools.clone()));
    let flows = OAuthFlowRegistry::new();
    let peers = SwitchboardService::peer_set();
    let emitter: Arc<dyn EventEmitter> = Arc::new(LogEventEmitter);
    let environment: Arc<dyn Environment> = Arc::new(OsEnvironment);
    let connections = ConnectionManager::new(
        registry.clone(),
        flows.clone(),
        emitter,
        environment,
        Arc::new(DefaultTransportFactory),
        SwitchboardService::notifier(&peers),
        settings.auto_reconnect.clone(),
    );
    let commands = Arc::new(CommandRegistry::new(&settings.commands));
    let service = SwitchboardService::new(
        registry,
        connections.clone(),
        flows,
        commands,
        peers,
    );

    connections
        .connect_to_target_servers(settings.servers.clone())
        .await;

    match settings.host_transport {
        HostTransport::Stdio => {
            proxy::serve_stdio(service).await?;
        }
        HostTransport::StreamableHttp => {
            let addr: std::net::SocketAddr = settings
                .listen_addr
                .parse()
                .with_context(|| format!("parse listen_addr {}", settings.listen_addr))?;
            let (handle, _local) = proxy::start_http_server(service, addr).await?;
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!(target = "server", "shutdown requested");
                }
                _ = handle => {}
            }
        }
    }

    connections.shutdown().await;
    Ok(())
}
