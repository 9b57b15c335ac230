use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::{self};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, warn};

use crate::auth::AuthProvider;
use crate::error::TransportError;

use super::{
    DEFAULT_PING_INTERVAL, DEFAULT_REQUEST_TIMEOUT, EVENT_CHANNEL_CAPACITY, Transport,
    TransportEvent, enforce_jsonrpc, sanitize_url,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

const CLEAN_CLOSE_CODES: &[u16] = &[1000, 1001];
const PROTOCOL_ERROR_CODES: &[u16] = &[1002, 1003, 1007, 1008, 1009, 1010, 1011];
const LOOPBACK_HOSTS: &[&str] = &["localhost", "127.0.0.1", "::1", "[::1]"];

/// WebSocket transport with heartbeat liveness. Upgrade requests carry the
/// auth headers; plaintext `ws://` is accepted for loopback only.
pub struct WebSocketTransport {
    server_name: String,
    url: String,
    timeout: Duration,
    ping_interval: Duration,
    auth: Option<Arc<dyn AuthProvider>>,
    sink: Arc<Mutex<Option<WsSink>>>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
    closed: Arc<AtomicBool>,
    tx: Option<mpsc::Sender<TransportEvent>>,
}

fn normalize_ws_url(url: &str) -> Result<String, TransportError> {
    let mut parsed = reqwest::Url::parse(url)
        .map_err(|err| TransportError::InvalidUrl(format!("{url}: {err}")))?;
    let scheme = parsed.scheme().to_string();
    match scheme.as_str() {
        "http" => {
            let _ = parsed.set_scheme("ws");
        }
        "https" => {
            let _ = parsed.set_scheme("wss");
        }
        "ws" | "wss" => {}
        other => {
            return Err(TransportError::InvalidUrl(format!(
                "unsupported scheme {other}"
            )));
        }
    }
    if parsed.scheme() == "ws" {
        let host = parsed.host_str().unwrap_or_default();
        if !LOOPBACK_HOSTS.contains(&host) {
            return Err(TransportError::InvalidUrl(
                "plaintext ws:// is only allowed for loopback hosts".into(),
            ));
        }
    }
    Ok(parsed.into())
}

fn classify_handshake_error(err: tungstenite::Error) -> TransportError {
    match err {
        tungstenite::Error::Http(response)
            if response.status() == tungstenite::http::StatusCode::UNAUTHORIZED =>
        {
            TransportError::Unauthorized
        }
        tungstenite::Error::Url(err) => TransportError::InvalidUrl(err.to_string()),
        tungstenite::Error::Io(err) => TransportError::ConnectionFailed(err.to_string()),
        other => TransportError::ConnectionFailed(other.to_string()),
    }
}

impl WebSocketTransport {
    pub fn new(
        server_name: &str,
        url: &str,
        timeout: Option<Duration>,
        ping_interval: Option<Duration>,
        auth: Option<Arc<dyn AuthProvider>>,
    ) -> Result<Self, TransportError> {
        Ok(Self {
            server_name: server_name.to_string(),
            url: normalize_ws_url(url)?,
            timeout: timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            ping_interval: ping_interval.unwrap_or(DEFAULT_PING_INTERVAL),
            auth,
            sink: Arc::new(Mutex::new(None)),
            tasks: Vec::new(),
            closed: Arc::new(AtomicBool::new(false)),
            tx: None,
        })
    }

    async fn connect_once(&self) -> Result<WsStream, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| TransportError::InvalidUrl(err.to_string()))?;
        if let Some(provider) = &self.auth {
            let headers = provider
                .headers()
                .await
                .map_err(|_| TransportError::Unauthorized)?;
            for (name, value) in headers {
                let name = HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                    TransportError::ProtocolError(format!("invalid header name {name}"))
                })?;
                let value = HeaderValue::from_str(&value)
                    .map_err(|_| TransportError::ProtocolError("invalid header value".into()))?;
                request.headers_mut().insert(name, value);
            }
        }
        match tokio::time::timeout(self.timeout, connect_async(request)).await {
            Err(_) => Err(TransportError::ConnectionTimeout),
            Ok(Ok((stream, _response))) => Ok(stream),
            Ok(Err(err)) => Err(classify_handshake_error(err)),
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn start(&mut self) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        let stream = match self.connect_once().await {
            Ok(stream) => stream,
            Err(TransportError::Unauthorized) => match &self.auth {
                Some(provider) => {
                    provider
                        .refresh()
                        .await
                        .map_err(|_| TransportError::Unauthorized)?;
                    self.connect_once().await?
                }
                None => return Err(TransportError::Unauthorized),
            },
            Err(err) => return Err(err),
        };
        debug!(target = "transport", server = %self.server_name,
               url = %sanitize_url(&self.url), "websocket open");

        let (sink, mut source) = stream.split();
        *self.sink.lock().await = Some(sink);

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.tx = Some(tx.clone());

        let last_pong = Arc::new(std::sync::Mutex::new(Instant::now()));

        let reader_tx = tx.clone();
        let reader_sink = self.sink.clone();
        let reader_pong = last_pong.clone();
        let reader_closed = self.closed.clone();
        let server_name = self.server_name.clone();
        let reader = tokio::spawn(async move {
            while let Some(item) = source.next().await {
                match item {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<serde_json::Value>(text.as_str()) {
                            Ok(message) => match enforce_jsonrpc(&message) {
                                Ok(()) => {
                                    if reader_tx
                                        .send(TransportEvent::Message(message))
                                        .await
                                        .is_err()
                                    {
                                        return;
                                    }
                                }
                                Err(err) => {
                                    warn!(target = "transport", server = %server_name,
                                          error = %err, "dropping non-jsonrpc frame");
                                }
                            },
                            Err(err) => {
                                warn!(target = "transport", server = %server_name,
                                      error = %err, "unparseable text frame");
                            }
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        let mut guard = reader_sink.lock().await;
                        if let Some(sink) = guard.as_mut() {
                            let _ = sink.send(Message::Pong(payload)).await;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        *reader_pong.lock().unwrap() = Instant::now();
                    }
                    Ok(Message::Close(frame)) => {
                        let code = frame.as_ref().map(|f| u16::from(f.code)).unwrap_or(1006);
                        if CLEAN_CLOSE_CODES.contains(&code) {
                            debug!(target = "transport", server = %server_name, code,
                                   "websocket closed cleanly");
                        } else if PROTOCOL_ERROR_CODES.contains(&code) {
                            let _ = reader_tx
                                .send(TransportEvent::Error(TransportError::ProtocolError(
                                    format!("websocket close code {code}"),
                                )))
                                .await;
                        } else {
                            let _ = reader_tx
                                .send(TransportEvent::Error(TransportError::ConnectionReset))
                                .await;
                        }
                        let _ = reader_tx.send(TransportEvent::Closed).await;
                        return;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        if !reader_closed.load(Ordering::SeqCst) {
                            warn!(target = "transport", server = %server_name, error = %err,
                                  "websocket read error");
                            let _ = reader_tx
                                .send(TransportEvent::Error(TransportError::ConnectionReset))
                                .await;
                        }
                        let _ = reader_tx.send(TransportEvent::Closed).await;
                        return;
                    }
                }
            }
            // peer vanished without a close frame
            if !reader_closed.load(Ordering::SeqCst) {
                let _ = reader_tx
                    .send(TransportEvent::Error(TransportError::ConnectionReset))
                    .await;
            }
            let _ = reader_tx.send(TransportEvent::Closed).await;
        });
        self.tasks.push(reader);

        let heartbeat_sink = self.sink.clone();
        let heartbeat_closed = self.closed.clone();
        let heartbeat_tx = tx;
        let ping_interval = self.ping_interval;
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(ping_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if heartbeat_closed.load(Ordering::SeqCst) {
                    return;
                }
                if last_pong.lock().unwrap().elapsed() > ping_interval * 2 {
                    let _ = heartbeat_tx
                        .send(TransportEvent::Error(TransportError::ConnectionReset))
                        .await;
                    let _ = heartbeat_tx.send(TransportEvent::Closed).await;
                    return;
                }
                let mut guard = heartbeat_sink.lock().await;
                if let Some(sink) = guard.as_mut()
                    && sink.send(Message::Ping(Vec::new().into())).await.is_err()
                {
                    return;
                }
            }
        });
        self.tasks.push(heartbeat);

        Ok(rx)
    }

    async fn send(&self, message: serde_json::Value) -> Result<(), TransportError> {
        let text = serde_json::to_string(&message)
            .map_err(|err| TransportError::ProtocolError(err.to_string()))?;
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(TransportError::TransportClosed)?;
        sink.send(Message::Text(text.into()))
            .await
            .map_err(|_| TransportError::TransportClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        {
            let mut guard = self.sink.lock().await;
            if let Some(sink) = guard.as_mut() {
                let _ = sink.send(Message::Close(None)).await;
                let _ = sink.flush().await;
            }
            guard.take();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(TransportEvent::Closed).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn https_normalizes_to_wss() {
        let t = WebSocketTransport::new("srv", "https://example.com/mcp", None, None, None)
            .unwrap();
        assert!(t.url.starts_with("wss://"));
    }

    #[test]
    fn http_loopback_normalizes_to_ws() {
        let t = WebSocketTransport::new("srv", "http://127.0.0.1:9000/mcp", None, None, None)
            .unwrap();
        assert!(t.url.starts_with("ws://"));
    }

    #[test]
    fn plaintext_ws_to_remote_host_is_rejected() {
        let err = WebSocketTransport::new("srv", "ws://example.com/mcp", None, None, None)
            .err()
            .expect("should reject");
        assert!(matches!(err, TransportError::InvalidUrl(_)));
    }

    #[test]
    fn unsupported_scheme_is_rejected() {
        let err = WebSocketTransport::new("srv", "ftp://example.com/mcp", None, None, None)
            .err()
            .expect("should reject");
        assert!(matches!(err, TransportError::InvalidUrl(_)));
    }

    #[test]
    fn close_code_classification() {
        for code in CLEAN_CLOSE_CODES {
            assert!(!PROTOCOL_ERROR_CODES.contains(code));
        }
        assert!(PROTOCOL_ERROR_CODES.contains(&1008));
        assert!(!CLEAN_CLOSE_CODES.contains(&1006));
    }
}
