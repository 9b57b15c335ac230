use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::transport::{Transport, TransportEvent};

pub const PROTOCOL_VERSION: &str = "2025-03-26";

const DISCONNECT_CHANNEL_CAPACITY: usize = 8;

/// What the connection manager observes about a live client.
#[derive(Debug)]
pub enum ClientEvent {
    /// The upstream announced a changed tool catalog.
    ToolListChanged,
    /// The transport ended. `error` carries the failure that preceded the
    /// close, absent for a clean shutdown.
    Disconnected { error: Option<TransportError> },
}

type PendingMap = HashMap<String, oneshot::Sender<Result<Value, TransportError>>>;

/// MCP client half for one upstream server. Owns the transport, correlates
/// request ids to in-flight callers, and forwards lifecycle signals to its
/// owner. Exactly one router task consumes the transport's event stream.
pub struct UpstreamClient {
    server_name: String,
    transport: Mutex<Box<dyn Transport>>,
    pending: Arc<Mutex<PendingMap>>,
    request_timeout: Duration,
    server_info: std::sync::Mutex<Option<Value>>,
}

fn id_key(id: &Value) -> Option<String> {
    match id {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl UpstreamClient {
    /// Start the transport, run the initialize handshake, and hand back the
    /// client plus its lifecycle event stream.
    pub async fn connect(
        server_name: &str,
        mut transport: Box<dyn Transport>,
        request_timeout: Duration,
    ) -> Result<(Arc<Self>, mpsc::Receiver<ClientEvent>), TransportError> {
        let events = transport.start().await?;
        let client = Arc::new(Self {
            server_name: server_name.to_string(),
            transport: Mutex::new(transport),
            pending: Arc::new(Mutex::new(HashMap::new())),
            request_timeout,
            server_info: std::sync::Mutex::new(None),
        });

        let (event_tx, event_rx) = mpsc::channel(DISCONNECT_CHANNEL_CAPACITY);
        tokio::spawn(route_events(
            Arc::downgrade(&client),
            client.pending.clone(),
            events,
            event_tx,
            client.server_name.clone(),
        ));

        let init_result = client
            .request(
                "initialize",
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": "mcp-switchboard",
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                }),
            )
            .await?;
        if let Some(version) = init_result.get("protocolVersion").and_then(|v| v.as_str()) {
            client
                .transport
                .lock()
                .await
                .set_protocol_version(version.to_string());
        }
        *client.server_info.lock().unwrap() = Some(init_result);
        client.notify("notifications/initialized", None).await?;

        Ok((client, event_rx))
    }

    pub fn server_info(&self) -> Option<Value> {
        self.server_info.lock().unwrap().clone()
    }

    pub async fn request(&self, method: &str, params: Value) -> Result<Value, TransportError> {
        let id = uuid::Uuid::new_v4().to_string();
        let message = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        if let Err(err) = self.transport.lock().await.send(message).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        let response = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome?,
            Ok(Err(_)) => return Err(TransportError::TransportClosed),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(TransportError::RequestTimeout);
            }
        };

        if let Some(error) = response.get("error") {
            let text = error
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown error");
            return Err(TransportError::ProtocolError(text.to_string()));
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        let mut message = json!({ "jsonrpc": "2.0", "method": method });
        if let Some(params) = params {
            message["params"] = params;
        }
        self.transport.lock().await.send(message).await
    }

    /// Full tool catalog, following pagination cursors.
    pub async fn list_tools(&self) -> Result<Vec<Value>, TransportError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = match &cursor {
                Some(cursor) => json!({ "cursor": cursor }),
                None => json!({}),
            };
            let result = self.request("tools/list", params).await?;
            if let Some(page) = result.get("tools").and_then(|t| t.as_array()) {
                tools.extend(page.iter().cloned());
            }
            match result.get("nextCursor").and_then(|c| c.as_str()) {
                Some(next) if !next.is_empty() => cursor = Some(next.to_string()),
                _ => break,
            }
        }
        Ok(tools)
    }

    /// Forward one tool invocation; the upstream's result is returned
    /// verbatim.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<Value, TransportError> {
        self.request(
            "tools/call",
            json!({
                "name": name,
                "arguments": arguments.unwrap_or_else(|| json!({})),
            }),
        )
        .await
    }

    pub async fn close(&self) -> Result<(), TransportError> {
        self.transport.lock().await.close().await
    }

    pub async fn session_id(&self) -> Option<String> {
        self.transport.lock().await.session_id()
    }
}

async fn route_events(
    client: Weak<UpstreamClient>,
    pending: Arc<Mutex<PendingMap>>,
    mut events: mpsc::Receiver<TransportEvent>,
    event_tx: mpsc::Sender<ClientEvent>,
    server_name: String,
) {
    let mut last_error: Option<TransportError> = None;
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Message(message) => {
                let is_response =
                    message.get("result").is_some() || message.get("error").is_some();
                let key = message.get("id").and_then(id_key);
                if is_response {
                    if let Some(key) = key {
                        match pending.lock().await.remove(&key) {
                            Some(tx) => {
                                let _ = tx.send(Ok(message));
                            }
                            None => {
                                debug!(target = "client", server = %server_name, id = %key,
                                       "unmatched response");
                            }
                        }
                    }
                } else if let Some(method) = message.get("method").and_then(|m| m.as_str()) {
                    match method {
                        "notifications/tools/list_changed" => {
                            let _ = event_tx.send(ClientEvent::ToolListChanged).await;
                        }
                        "ping" => {
                            if let (Some(id), Some(client)) =
                                (message.get("id").cloned(), client.upgrade())
                            {
                                let pong = json!({ "jsonrpc": "2.0", "id": id, "result": {} });
                                let _ = client.transport.lock().await.send(pong).await;
                            }
                        }
                        other => {
                            debug!(target = "client", server = %server_name, method = %other,
                                   "ignoring unsolicited message");
                        }
                    }
                }
            }
            TransportEvent::Error(err) => {
                warn!(target = "client", server = %server_name, error = %err, "transport error");
                last_error = Some(err);
            }
            TransportEvent::Closed => {
                let mut guard = pending.lock().await;
                for (_, tx) in guard.drain() {
                    let _ = tx.send(Err(TransportError::TransportClosed));
                }
                drop(guard);
                let _ = event_tx
                    .send(ClientEvent::Disconnected {
                        error: last_error.take(),
                    })
                    .await;
                return;
            }
        }
    }
    // transport dropped its sender without a Closed event; treat as unclean
    let mut guard = pending.lock().await;
    for (_, tx) in guard.drain() {
        let _ = tx.send(Err(TransportError::TransportClosed));
    }
    drop(guard);
    let _ = event_tx
        .send(ClientEvent::Disconnected {
            error: last_error.take(),
        })
        .await;
}
