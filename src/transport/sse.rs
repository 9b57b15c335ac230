use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use sse_stream::SseStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::auth::AuthProvider;
use crate::error::TransportError;

use super::{
    DEFAULT_REQUEST_TIMEOUT, EVENT_CHANNEL_CAPACITY, Transport, TransportEvent, auth_header_map,
    enforce_jsonrpc, map_reqwest_error, sanitize_url,
};

pub(crate) const SESSION_ID_HEADER: &str = "Mcp-Session-Id";

/// Server-Sent Events transport: one long-lived GET stream carries
/// server-to-client messages, sends are POSTs against the same URL. Auth goes
/// in headers, never the URL.
pub struct SseTransport {
    server_name: String,
    url: String,
    timeout: Duration,
    auth: Option<Arc<dyn AuthProvider>>,
    http: reqwest::Client,
    session_id: String,
    tx: Option<mpsc::Sender<TransportEvent>>,
    reader: Option<tokio::task::JoinHandle<()>>,
    closed: Arc<AtomicBool>,
}

impl SseTransport {
    pub fn new(
        server_name: &str,
        url: String,
        timeout: Option<Duration>,
        auth: Option<Arc<dyn AuthProvider>>,
    ) -> Self {
        let timeout = timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        Self {
            server_name: server_name.to_string(),
            url,
            timeout,
            auth,
            // a whole-request timeout would sever the long-lived event
            // stream, so only connecting is bounded here
            http: reqwest::Client::builder()
                .connect_timeout(timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            session_id: uuid::Uuid::new_v4().to_string(),
            tx: None,
            reader: None,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn open_stream(&self) -> Result<reqwest::Response, TransportError> {
        let mut attempted_refresh = false;
        loop {
            let mut headers = auth_header_map(self.auth.as_ref()).await?;
            headers.insert(
                reqwest::header::ACCEPT,
                reqwest::header::HeaderValue::from_static("text/event-stream"),
            );
            let request = self.http.get(&self.url).headers(headers);
            let response = match tokio::time::timeout(self.timeout, request.send()).await {
                Ok(outcome) => outcome.map_err(map_reqwest_error)?,
                Err(_) => return Err(TransportError::ConnectionTimeout),
            };

            if response.status() == reqwest::StatusCode::UNAUTHORIZED {
                match (&self.auth, attempted_refresh) {
                    (Some(provider), false) => {
                        attempted_refresh = true;
                        provider
                            .refresh()
                            .await
                            .map_err(|_| TransportError::Unauthorized)?;
                        continue;
                    }
                    _ => return Err(TransportError::Unauthorized),
                }
            }
            if !response.status().is_success() {
                return Err(TransportError::ConnectionFailed(format!(
                    "event stream returned status {}",
                    response.status()
                )));
            }
            return Ok(response);
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn start(&mut self) -> Result<mpsc::Receiver<TransportEvent>, TransportError> {
        let response = self.open_stream().await?;
        debug!(target = "transport", server = %self.server_name,
               url = %sanitize_url(&self.url), "event stream open");

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        self.tx = Some(tx.clone());

        let closed = self.closed.clone();
        let server_name = self.server_name.clone();
        self.reader = Some(tokio::spawn(async move {
            let mut stream = SseStream::from_byte_stream(response.bytes_stream());
            let mut error_emitted = false;
            while let Some(item) = stream.next().await {
                match item {
                    Ok(sse) => {
                        let Some(data) = sse.data else { continue };
                        if data.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<serde_json::Value>(&data) {
                            Ok(message) => match enforce_jsonrpc(&message) {
                                Ok(()) => {
                                    if tx.send(TransportEvent::Message(message)).await.is_err() {
                                        return;
                                    }
                                }
                                Err(err) => {
                                    warn!(target = "transport", server = %server_name,
                                          error = %err, "dropping non-jsonrpc event");
                                }
                            },
                            Err(err) => {
                                warn!(target = "transport", server = %server_name,
                                      error = %err, "unparseable event payload");
                            }
                        }
                    }
                    Err(err) => {
                        if !closed.load(Ordering::SeqCst) {
                            warn!(target = "transport", server = %server_name, error = %err,
                                  "event stream error");
                            error_emitted = true;
                            let _ = tx
                                .send(TransportEvent::Error(TransportError::ConnectionReset))
                                .await;
                        }
                        break;
                    }
                }
            }
            // the server dropped the stream; without a local close that is unclean
            if !closed.load(Ordering::SeqCst) && !error_emitted {
                let _ = tx
                    .send(TransportEvent::Error(TransportError::ConnectionReset))
                    .await;
            }
            let _ = tx.send(TransportEvent::Closed).await;
        }));

        Ok(rx)
    }

    async fn send(&self, message: serde_json::Value) -> Result<(), TransportError> {
        let mut attempted_refresh = false;
        loop {
            let headers = auth_header_map(self.auth.as_ref()).await?;
            let response = self
                .http
                .post(&self.url)
                .headers(headers)
                .header(SESSION_ID_HEADER, &self.session_id)
                .json(&message)
                .timeout(self.timeout)
                .send()
                .await
                .map_err(map_reqwest_error)?;

            if response.status() == reqwest::StatusCode::UNAUTHORIZED {
                match (&self.auth, attempted_refresh) {
                    (Some(provider), false) => {
                        attempted_refresh = true;
                        provider
                            .refresh()
                            .await
                            .map_err(|_| TransportError::Unauthorized)?;
                        continue;
                    }
                    _ => return Err(TransportError::Unauthorized),
                }
            }
            if !response.status().is_success() {
                return Err(TransportError::ConnectionFailed(format!(
                    "post returned status {}",
                    response.status()
                )));
            }
            // some servers answer simple requests inline instead of via the stream
            if let Ok(body) = response.json::<serde_json::Value>().await
                && enforce_jsonrpc(&body).is_ok()
                && let Some(tx) = &self.tx
            {
                let _ = tx.send(TransportEvent::Message(body)).await;
            }
            return Ok(());
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(TransportEvent::Closed).await;
        }
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        Some(self.session_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_is_generated_on_construction() {
        let a = SseTransport::new("srv", "http://127.0.0.1:9/sse".into(), None, None);
        let b = SseTransport::new("srv", "http://127.0.0.1:9/sse".into(), None, None);
        assert_ne!(a.session_id(), b.session_id());
        assert!(a.session_id().is_some());
    }
}
