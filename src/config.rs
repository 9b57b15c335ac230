use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fs, path::PathBuf};

/// Service namespace used for keychain entries and env-var prefixes.
pub const NAMESPACE: &str = "dev.mcp.switchboard";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
    },
    Sse {
        url: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        reconnect: Option<bool>,
    },
    Websocket {
        url: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        ping_interval_ms: Option<u64>,
        #[serde(default)]
        reconnect: Option<bool>,
    },
    StreamableHttp {
        url: String,
        #[serde(default)]
        timeout_ms: Option<u64>,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        reconnect: Option<bool>,
    },
}

impl TransportConfig {
    /// Whether the owner may auto-reconnect this transport after an unclean
    /// close. Defaults to true unless the server opts out.
    pub fn reconnect_enabled(&self) -> bool {
        match self {
            TransportConfig::Stdio { .. } => true,
            TransportConfig::Sse { reconnect, .. }
            | TransportConfig::Websocket { reconnect, .. }
            | TransportConfig::StreamableHttp { reconnect, .. } => reconnect.unwrap_or(true),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    None,
    Bearer {
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        token_env: Option<String>,
    },
    Oauth2Client {
        client_id: String,
        client_secret: String,
        token_endpoint: String,
        #[serde(default)]
        scope: Option<String>,
        #[serde(default)]
        audience: Option<String>,
    },
    Oauth2Code {
        client_id: String,
        #[serde(default)]
        client_secret: Option<String>,
        authorization_endpoint: String,
        token_endpoint: String,
        redirect_uri: String,
        #[serde(default)]
        scope: Option<String>,
        #[serde(default)]
        audience: Option<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SecretProviderConfig {
    /// Resolves keys against the process environment.
    Env,
    /// Resolves keys against the OS keychain under the given service name.
    Keyring { service: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetServerConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub transport: TransportConfig,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
    #[serde(default)]
    pub secret_providers: HashMap<String, SecretProviderConfig>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    10
}
fn default_initial_delay_ms() -> u64 {
    1000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}
fn default_max_delay_ms() -> u64 {
    60_000
}
fn default_jitter() -> f64 {
    0.25
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub list: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostTransport {
    StreamableHttp,
    Stdio,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub servers: Vec<TargetServerConfig>,
    #[serde(default)]
    pub auto_reconnect: ReconnectSettings,
    #[serde(default)]
    pub expose_tools: Option<Vec<String>>,
    #[serde(default)]
    pub commands: CommandSettings,
    pub listen_addr: String,
    pub host_transport: HostTransport,
}

// Config paths abstraction to make IO testable
pub trait ConfigProvider: Send + Sync {
    fn base_dir(&self) -> PathBuf;
}

#[derive(Default, Clone)]
pub struct OsConfigProvider;

impl ConfigProvider for OsConfigProvider {
    fn base_dir(&self) -> PathBuf {
        let base = dirs::config_dir().unwrap_or_else(|| dirs::home_dir().unwrap_or_default());
        base.join(NAMESPACE)
    }
}

pub fn default_settings() -> Settings {
    Settings {
        servers: Vec::new(),
        auto_reconnect: ReconnectSettings::default(),
        expose_tools: None,
        commands: CommandSettings::default(),
        listen_addr: "127.0.0.1:8091".to_string(),
        host_transport: HostTransport::StreamableHttp,
    }
}

pub fn settings_path(cp: &dyn ConfigProvider) -> PathBuf {
    cp.base_dir().join("settings.json")
}

pub fn load_settings_with(cp: &dyn ConfigProvider) -> Settings {
    let path = settings_path(cp);
    if let Ok(content) = fs::read_to_string(&path)
        && let Ok(s) = serde_json::from_str::<Settings>(&content)
    {
        return s;
    }
    default_settings()
}

pub fn save_settings_with(cp: &dyn ConfigProvider, settings: &Settings) -> Result<(), String> {
    fs::create_dir_all(cp.base_dir()).map_err(|e| format!("create config dir: {e}"))?;
    let path = settings_path(cp);
    let content = serde_json::to_string_pretty(settings).map_err(|e| format!("to json: {e}"))?;
    fs::write(&path, content).map_err(|e| format!("write settings: {e}"))
}
