use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use sse_stream::SseStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::auth::AuthProvider;
use crate::error::TransportError;

use super::sse::SESSION_ID_HEADER;
use super::{
    DEFAULT_REQUEST_TIMEOUT, EVENT_CHANNEL_CAPACITY, Transport, TransportEvent, auth_header_map,
    enforce_jsonrpc, map_reqwest_error,
};

const PROTOCOL_VERSION_HEADER: &str = "MCP-Protocol-Version";

/// Streamable HTTP transport: every outgoing message is a POST; the server
/// answers with a single JSON body or an SSE stream of messages. The session
/// id handed out at initialize is replayed on every subsequent request, and
/// auth headers are re-fetched per request so a refreshed token applies
/// without rebuilding anything.
pub struct StreamableHttpTransport {
    server_name: String,
    url: String,
    timeout: Duration,
    auth: Option<Arc<dyn AuthProvider>>,
    http: reqwest::Client,
    session_id: Mutex<Option<String>>,
    protocol_version: Mutex<Option<String>>,
    tx: Option<mpsc::Sender<TransportEvent>>,
}

impl StreamableHttpTransport {
    pub fn new(
        server_name: &str,
        url: String,
        timeout: Option<Duration>,
        session_id: Option<String>,
        auth: Option<Arc<dyn AuthProvider>>,
    ) -> Self {
        Self {
            server_name: server_name.to_string(),
            url,
            timeout: timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
            auth,
            http: reqwest::Client::new(),
            session_id: Mutex::new(session_id),
            protocol_version: Mutex::new(None),
            tx: None,
        }
    }

    async fn post_once(
        &self,
        message: &serde_json::Value,
    ) -> Result<reqwest::Response, TransportError> {
        let headers = auth_header_map(self.auth.as_ref()).await?;
        let mut request = self
            .http
            .post(&self.url)
            .headers(headers)
            .header(
                reqwest::header::ACCEPT,
                "application/json, text/event-stream",
            )
            .json(message);
        if let Some(session) = self.session_id.lock().unwrap().clone() {
            request = request.header(SESSION_ID_HEADER, session);
        }
        if let Some(version) = self.protocol_version.lock().unwrap().clone() {
            request = request.header(PROTOCOL_VERSION_HEADER, version);
        }
        // bound request establishment only; a streamed response body may
        // legitimately outlive the request timeout
        match tokio::time::timeout(self.timeout, request.send()).await {
            Ok(outcome) => outcome.map_err(map_reqwest_error),
            Err(_) => Err(TransportError::RequestTimeout),
        }
    }

    fn capture_session(&self, response: &reqwest::Response) {
        if let Some(session) = response
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut guard = self.session_id.lock().unwrap();
            if guard.as_deref() != Some(session) {
                debug!(target = "transport", server = %self.server_name, "session established");
                *guard = Some(session.to_string());
            }
        }
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn start(&mut self) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        // connectionless: each message is its own request, so starting only
        // sets up the event stream
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.tx = Some(tx);
        Ok(rx)
    }

    async fn send(&self, message: serde_json::Value) -> Result<(), TransportError> {
        let tx = self
            .tx
            .as_ref()
            .ok_or(TransportError::TransportClosed)?
            .clone();

        let mut response = self.post_once(&message).await?;
        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            match &self.auth {
                Some(provider) => {
                    provider
                        .refresh()
                        .await
                        .map_err(|_| TransportError::Unauthorized)?;
                    response = self.post_once(&message).await?;
                    if response.status() == reqwest::StatusCode::UNAUTHORIZED {
                        return Err(TransportError::Unauthorized);
                    }
                }
                None => return Err(TransportError::Unauthorized),
            }
        }

        let status = response.status();
        if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            return Err(TransportError::ServiceUnavailable);
        }
        if !status.is_success() {
            return Err(TransportError::ConnectionFailed(format!(
                "post returned status {status}"
            )));
        }
        self.capture_session(&response);

        if status == reqwest::StatusCode::ACCEPTED || status == reqwest::StatusCode::NO_CONTENT {
            return Ok(());
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if content_type.starts_with("text/event-stream") {
            let server_name = self.server_name.clone();
            tokio::spawn(async move {
                let mut stream = SseStream::from_byte_stream(response.bytes_stream());
                while let Some(item) = stream.next().await {
                    match item {
                        Ok(sse) => {
                            let Some(data) = sse.data else { continue };
                            match serde_json::from_str::<serde_json::Value>(&data) {
                                Ok(body) if enforce_jsonrpc(&body).is_ok() => {
                                    if tx.send(TransportEvent::Message(body)).await.is_err() {
                                        return;
                                    }
                                }
                                _ => {
                                    warn!(target = "transport", server = %server_name,
                                          "dropping unparseable stream event");
                                }
                            }
                        }
                        Err(err) => {
                            warn!(target = "transport", server = %server_name, error = %err,
                                  "response stream error");
                            return;
                        }
                    }
                }
            });
            return Ok(());
        }

        let body = response
            .json::<serde_json::Value>()
            .await
            .map_err(|err| TransportError::ProtocolError(err.without_url().to_string()))?;
        enforce_jsonrpc(&body)?;
        let _ = tx.send(TransportEvent::Message(body)).await;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(TransportEvent::Closed).await;
        }
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.lock().unwrap().clone()
    }

    fn set_protocol_version(&self, version: String) {
        *self.protocol_version.lock().unwrap() = Some(version);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_before_start_is_transport_closed() {
        let t = StreamableHttpTransport::new(
            "srv",
            "http://127.0.0.1:9/mcp".into(),
            None,
            None,
            None,
        );
        let err = t.send(serde_json::json!({"jsonrpc": "2.0"})).await.unwrap_err();
        assert_eq!(err, TransportError::TransportClosed);
    }

    #[test]
    fn configured_session_id_is_advertised() {
        let t = StreamableHttpTransport::new(
            "srv",
            "http://127.0.0.1:9/mcp".into(),
            None,
            Some("session-1".into()),
            None,
        );
        assert_eq!(t.session_id().as_deref(), Some("session-1"));
    }
}
