use serde_json::json;

pub const EVENT_SERVER_CONNECTED: &str = "server.connected";
pub const EVENT_SERVER_DISCONNECTED: &str = "server.disconnected";
pub const EVENT_SERVER_RECONNECTING: &str = "server.reconnecting";
pub const EVENT_MAX_RECONNECTION_ATTEMPTS: &str = "server.max_reconnection_attempts";
pub const EVENT_AUTHORIZATION_PENDING: &str = "auth.authorization_pending";

pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: &str, payload: &serde_json::Value);
}

/// Production emitter: events land in the structured log stream.
#[derive(Default, Clone)]
pub struct LogEventEmitter;

impl EventEmitter for LogEventEmitter {
    fn emit(&self, event: &str, payload: &serde_json::Value) {
        tracing::info!(target = "events", event = %event, payload = %payload, "event");
    }
}

/// Buffering emitter for assertions in tests.
#[derive(Default, Clone)]
pub struct BufferingEventEmitter(
    pub std::sync::Arc<std::sync::Mutex<Vec<(String, serde_json::Value)>>>,
);

impl BufferingEventEmitter {
    pub fn events(&self) -> Vec<(String, serde_json::Value)> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.0.lock().unwrap().iter().filter(|(e, _)| e == event).count()
    }
}

impl EventEmitter for BufferingEventEmitter {
    fn emit(&self, event: &str, payload: &serde_json::Value) {
        self.0
            .lock()
            .unwrap()
            .push((event.to_string(), payload.clone()));
    }
}

// Helper functions to standardize payload shapes

pub fn server_connected(emitter: &dyn EventEmitter, server_name: &str, tools: usize) {
    emitter.emit(
        EVENT_SERVER_CONNECTED,
        &json!({ "server_name": server_name, "tools": tools }),
    );
}

pub fn server_disconnected(emitter: &dyn EventEmitter, server_name: &str, reason: &str) {
    emitter.emit(
        EVENT_SERVER_DISCONNECTED,
        &json!({ "server_name": server_name, "reason": reason }),
    );
}

pub fn server_reconnecting(emitter: &dyn EventEmitter, server_name: &str, attempt: u32) {
    emitter.emit(
        EVENT_SERVER_RECONNECTING,
        &json!({ "server_name": server_name, "attempt": attempt }),
    );
}

pub fn max_reconnection_attempts(emitter: &dyn EventEmitter, server_name: &str, attempts: u32) {
    emitter.emit(
        EVENT_MAX_RECONNECTION_ATTEMPTS,
        &json!({ "server_name": server_name, "attempts": attempts }),
    );
}

pub fn authorization_pending(emitter: &dyn EventEmitter, server_name: &str, url: &str) {
    emitter.emit(
        EVENT_AUTHORIZATION_PENDING,
        &json!({ "server_name": server_name, "authorization_url": url }),
    );
}

/// Narrow sink the connection manager uses to ask the host side for a
/// `notifications/tools/list_changed` broadcast without holding a reference
/// to the proxy itself.
pub trait ListChangedSink: Send + Sync {
    fn notify(&self);
}

/// No-op sink for tests and for serving before any peer connects.
#[derive(Default, Clone)]
pub struct NullListChangedSink;

impl ListChangedSink for NullListChangedSink {
    fn notify(&self) {}
}

/// Counting sink for assertions in tests.
#[derive(Default, Clone)]
pub struct CountingListChangedSink(pub std::sync::Arc<std::sync::atomic::AtomicUsize>);

impl ListChangedSink for CountingListChangedSink {
    fn notify(&self) {
        self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
    }
}
