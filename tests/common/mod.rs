use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc};

use mcp_switchboard::auth::AuthProvider;
use mcp_switchboard::config::TransportConfig;
use mcp_switchboard::connection::TransportFactory;
use mcp_switchboard::error::TransportError;
use mcp_switchboard::transport::{Transport, TransportEvent};

/// In-process scripted MCP server. Each `build` hands out a fresh transport
/// wired to the same server state, so reconnects observe catalog changes.
pub struct FakeServer {
    pub tools: Mutex<Vec<Value>>,
    pub calls: Mutex<Vec<(String, Value)>>,
    pub connects: AtomicUsize,
    fail_connects: AtomicUsize,
    current: Mutex<Option<mpsc::Sender<TransportEvent>>>,
}

impl FakeServer {
    pub fn new(tools: Vec<Value>) -> Arc<Self> {
        Arc::new(Self {
            tools: Mutex::new(tools),
            calls: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            fail_connects: AtomicUsize::new(0),
            current: Mutex::new(None),
        })
    }

    pub fn tool(name: &str) -> Value {
        json!({ "name": name, "description": format!("{name} tool"),
                "inputSchema": { "type": "object" } })
    }

    /// Make the next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: usize) {
        self.fail_connects.store(n, Ordering::SeqCst);
    }

    pub async fn set_tools(&self, tools: Vec<Value>) {
        *self.tools.lock().await = tools;
    }

    /// Simulate the server dying: unclean error then close.
    pub async fn kill_unclean(&self) {
        if let Some(tx) = self.current.lock().await.take() {
            let _ = tx
                .send(TransportEvent::Error(TransportError::ConnectionReset))
                .await;
            let _ = tx.send(TransportEvent::Closed).await;
        }
    }

    /// Push an upstream tools/list_changed notification.
    pub async fn announce_tools_changed(&self) {
        if let Some(tx) = self.current.lock().await.as_ref() {
            let _ = tx
                .send(TransportEvent::Message(json!({
                    "jsonrpc": "2.0",
                    "method": "notifications/tools/list_changed",
                })))
                .await;
        }
    }
}

pub struct FakeTransport {
    server: Arc<FakeServer>,
    tx: Option<mpsc::Sender<TransportEvent>>,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn start(&mut self) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        if self
            .server
            .fail_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransportError::ConnectionFailed("simulated outage".into()));
        }
        let (tx, rx) = mpsc::channel(64);
        self.tx = Some(tx.clone());
        *self.server.current.lock().await = Some(tx);
        self.server.connects.fetch_add(1, Ordering::SeqCst);
        Ok(rx)
    }

    async fn send(&self, message: Value) -> Result<(), TransportError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or(TransportError::TransportClosed)?
            .clone();
        let method = message
            .get("method")
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string();
        let id = message.get("id").cloned();
        let reply = |id: &Option<Value>, result: Value| {
            json!({ "jsonrpc": "2.0", "id": id.clone().unwrap_or(Value::Null), "result": result })
        };
        match method.as_str() {
            "initialize" => {
                let _ = tx
                    .send(TransportEvent::Message(reply(&id, json!({
                        "protocolVersion": "2025-03-26",
                        "capabilities": { "tools": { "listChanged": true } },
                        "serverInfo": { "name": "fake-upstream", "version": "0.0.1" },
                    }))))
                    .await;
            }
            "tools/list" => {
                let tools = self.server.tools.lock().await.clone();
                let _ = tx
                    .send(TransportEvent::Message(reply(&id, json!({ "tools": tools }))))
                    .await;
            }
            "tools/call" => {
                let params = message.get("params").cloned().unwrap_or(Value::Null);
                let name = params
                    .get("name")
                    .and_then(|n| n.as_str())
                    .unwrap_or_default()
                    .to_string();
                let args = params.get("arguments").cloned().unwrap_or(Value::Null);
                self.server.calls.lock().await.push((name.clone(), args));
                let _ = tx
                    .send(TransportEvent::Message(reply(&id, json!({
                        "content": [{ "type": "text", "text": format!("ok:{name}") }],
                    }))))
                    .await;
            }
            m if m.starts_with("notifications/") => {}
            _ => {
                if let Some(id) = id {
                    let _ = tx
                        .send(TransportEvent::Message(json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "error": { "code": -32601, "message": "method not found" },
                        })))
                        .await;
                }
            }
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(TransportEvent::Closed).await;
        }
        self.server.current.lock().await.take();
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeFactory {
    pub servers: std::sync::Mutex<HashMap<String, Arc<FakeServer>>>,
}

impl FakeFactory {
    pub fn with_server(self: Arc<Self>, name: &str, server: Arc<FakeServer>) -> Arc<Self> {
        self.servers
            .lock()
            .unwrap()
            .insert(name.to_string(), server);
        self
    }
}

impl TransportFactory for FakeFactory {
    fn build(
        &self,
        server_name: &str,
        _config: &TransportConfig,
        _resolved_env: HashMap<String, String>,
        _auth: Option<Arc<dyn AuthProvider>>,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let server = self
            .servers
            .lock()
            .unwrap()
            .get(server_name)
            .cloned()
            .ok_or_else(|| TransportError::ConnectionFailed("unknown fake server".into()))?;
        Ok(Box::new(FakeTransport { server, tx: None }))
    }
}

/// Poll until `probe` returns true or the timeout lapses.
pub async fn wait_for<F, Fut>(timeout: Duration, mut probe: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if probe().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// A stdio target-server config; the fake factory ignores the details.
pub fn stdio_config(name: &str) -> mcp_switchboard::config::TargetServerConfig {
    mcp_switchboard::config::TargetServerConfig {
        name: name.to_string(),
        description: String::new(),
        transport: TransportConfig::Stdio {
            command: "fake".into(),
            args: vec![],
            env: HashMap::new(),
        },
        env: HashMap::new(),
        auth: None,
        secret_providers: HashMap::new(),
        enabled: true,
    }
}
