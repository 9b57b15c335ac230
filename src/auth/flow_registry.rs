use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::AuthError;

/// One pending authorization-code flow, owned by the provider that opened it.
/// `complete` performs the token exchange; `cancel` rejects the provider's
/// pending refresh.
#[async_trait]
pub trait FlowHandler: Send + Sync {
    async fn complete(&self, code: &str) -> Result<(), AuthError>;
    async fn cancel(&self);
}

struct FlowEntry {
    handler: Arc<dyn FlowHandler>,
    expiry: tokio::task::JoinHandle<()>,
}

/// Process-wide mapping from CSRF state to the flow that produced it. The
/// host completes flows through the proxy without knowing which provider owns
/// them, so lookup must be O(1) and safe under concurrent registration.
///
/// States are single-use: `complete` removes the entry before the exchange is
/// attempted, so a replayed state fails fast with `InvalidState`. Abandoned
/// flows are reaped by a per-entry timer rather than an on-query sweep, which
/// bounds memory under abandonment.
pub struct OAuthFlowRegistry {
    flows: Mutex<HashMap<String, FlowEntry>>,
}

impl OAuthFlowRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            flows: Mutex::new(HashMap::new()),
        })
    }

    pub async fn register(
        self: &Arc<Self>,
        state: String,
        handler: Arc<dyn FlowHandler>,
        ttl: Duration,
    ) {
        let registry = Arc::downgrade(self);
        let key = state.clone();
        let expiry = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Some(registry) = registry.upgrade() {
                let removed = registry.flows.lock().await.remove(&key);
                if let Some(entry) = removed {
                    tracing::debug!(target = "oauth", "authorization flow expired");
                    entry.handler.cancel().await;
                }
            }
        });
        let previous = self
            .flows
            .lock()
            .await
            .insert(state, FlowEntry { handler, expiry });
        if let Some(previous) = previous {
            previous.expiry.abort();
            previous.handler.cancel().await;
        }
    }

    /// Consume the state and run the token exchange. Unknown or replayed
    /// states fail with `InvalidState` without touching any provider.
    pub async fn complete(&self, state: &str, code: &str) -> Result<(), AuthError> {
        let entry = self.flows.lock().await.remove(state);
        let Some(entry) = entry else {
            return Err(AuthError::InvalidState);
        };
        entry.expiry.abort();
        entry.handler.complete(code).await
    }

    /// Abandon a flow (provider teardown). The pending refresh is rejected.
    pub async fn cancel(&self, state: &str) {
        let entry = self.flows.lock().await.remove(state);
        if let Some(entry) = entry {
            entry.expiry.abort();
            entry.handler.cancel().await;
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.flows.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingHandler {
        completed: AtomicUsize,
        cancelled: AtomicUsize,
        outcome: Result<(), AuthError>,
    }

    impl RecordingHandler {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                completed: AtomicUsize::new(0),
                cancelled: AtomicUsize::new(0),
                outcome: Ok(()),
            })
        }
    }

    #[async_trait]
    impl FlowHandler for RecordingHandler {
        async fn complete(&self, _code: &str) -> Result<(), AuthError> {
            self.completed.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }

        async fn cancel(&self) {
            self.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn unknown_state_is_invalid() {
        let registry = OAuthFlowRegistry::new();
        let err = registry.complete("nope", "code").await.unwrap_err();
        assert_eq!(err, AuthError::InvalidState);
    }

    #[tokio::test]
    async fn states_are_single_use() {
        let registry = OAuthFlowRegistry::new();
        let handler = RecordingHandler::ok();
        registry
            .register("state-a".into(), handler.clone(), Duration::from_secs(600))
            .await;

        registry.complete("state-a", "code").await.unwrap();
        assert_eq!(handler.completed.load(Ordering::SeqCst), 1);

        let replay = registry.complete("state-a", "code").await.unwrap_err();
        assert_eq!(replay, AuthError::InvalidState);
        assert_eq!(handler.completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_flows_are_isolated() {
        let registry = OAuthFlowRegistry::new();
        let a = RecordingHandler::ok();
        let b = RecordingHandler::ok();
        registry
            .register("state-a".into(), a.clone(), Duration::from_secs(600))
            .await;
        registry
            .register("state-b".into(), b.clone(), Duration::from_secs(600))
            .await;

        registry.complete("state-a", "code").await.unwrap();
        assert_eq!(b.completed.load(Ordering::SeqCst), 0);
        assert_eq!(registry.pending_count().await, 1);

        registry.complete("state-b", "code").await.unwrap();
        assert_eq!(b.completed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_is_timer_driven() {
        let registry = OAuthFlowRegistry::new();
        let handler = RecordingHandler::ok();
        registry
            .register("state-a".into(), handler.clone(), Duration::from_secs(600))
            .await;

        tokio::time::sleep(Duration::from_secs(601)).await;
        tokio::task::yield_now().await;
        assert_eq!(registry.pending_count().await, 0);
        assert_eq!(handler.cancelled.load(Ordering::SeqCst), 1);
        let err = registry.complete("state-a", "code").await.unwrap_err();
        assert_eq!(err, AuthError::InvalidState);
    }
}
