use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;

use crate::environment::{Environment, is_truthy};
use crate::error::ConfigError;

/// Window before expiry inside which a token counts as expired, so refresh
/// happens while the old token is still usable.
pub const DEFAULT_REFRESH_BUFFER: Duration = Duration::from_secs(300);

pub const TOKEN_STORAGE_ENV: &str = "MCP_SWITCHBOARD_TOKEN_STORAGE";
pub const RUNTIME_ENV: &str = "MCP_SWITCHBOARD_ENV";

const SERVER_ID_CHARSET: &str = "server id must match [A-Za-z0-9._-]+";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenData {
    pub access_token: String,
    pub token_type: String,
    pub expires_at: SystemTime,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

impl TokenData {
    pub fn new(
        access_token: impl Into<String>,
        token_type: impl Into<String>,
        expires_at: SystemTime,
    ) -> Result<Self, ConfigError> {
        let access_token = access_token.into();
        let token_type = token_type.into();
        if access_token.is_empty() {
            return Err(ConfigError::InvalidArgument("empty access token".into()));
        }
        if token_type.is_empty() {
            return Err(ConfigError::InvalidArgument("empty token type".into()));
        }
        Ok(Self {
            access_token,
            token_type,
            expires_at,
            scope: None,
            refresh_token: None,
        })
    }

    pub fn with_scope(mut self, scope: Option<String>) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_refresh_token(mut self, refresh_token: Option<String>) -> Self {
        self.refresh_token = refresh_token;
        self
    }

    /// Expiry check with a proactive buffer: a token whose remaining lifetime
    /// is within `buffer` is already expired.
    pub fn is_expired_with(&self, buffer: Duration, now: SystemTime) -> bool {
        match now.checked_add(buffer) {
            Some(horizon) => horizon >= self.expires_at,
            None => true,
        }
    }
}

pub type RefreshCallback =
    Arc<dyn Fn() -> BoxFuture<'static, Result<(), crate::error::AuthError>> + Send + Sync>;

#[async_trait]
pub trait TokenStorage: Send + Sync {
    async fn store(&self, token: TokenData);
    async fn retrieve(&self) -> Option<TokenData>;
    async fn is_expired(&self) -> bool;
    async fn clear(&self);
    /// Install the proactive-refresh callback. Arms a timer for the token
    /// currently stored, and re-arms on every subsequent `store`.
    async fn set_refresh_callback(&self, callback: RefreshCallback);
}

/// One pending refresh timer. Re-armed on store, released on clear and after
/// firing; callback failures are logged and never propagate.
struct RefreshTimer {
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    callback: Mutex<Option<RefreshCallback>>,
}

impl RefreshTimer {
    fn new() -> Self {
        Self {
            handle: Mutex::new(None),
            callback: Mutex::new(None),
        }
    }

    fn set_callback(&self, callback: RefreshCallback) {
        *self.callback.lock().unwrap() = Some(callback);
    }

    fn cancel(&self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Arm the single timer to fire at `expires_at - buffer`. Expired tokens
    /// never arm; the next `store` will.
    fn arm(&self, expires_at: SystemTime, buffer: Duration) {
        self.cancel();
        let callback = match self.callback.lock().unwrap().clone() {
            Some(cb) => cb,
            None => return,
        };
        let fire_at = match expires_at.checked_sub(buffer) {
            Some(t) => t,
            None => return,
        };
        let delay = match fire_at.duration_since(SystemTime::now()) {
            Ok(d) => d,
            Err(_) => return,
        };
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(err) = callback().await {
                warn!(target = "auth", error = %err, "proactive token refresh failed");
            }
        });
        *self.handle.lock().unwrap() = Some(handle);
    }
}

impl Drop for RefreshTimer {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.lock().unwrap().take() {
            handle.abort();
        }
    }
}

/// Process-local storage; tokens are lost on shutdown. Always available.
pub struct MemoryTokenStorage {
    token: RwLock<Option<TokenData>>,
    refresh_buffer: Duration,
    timer: RefreshTimer,
}

impl MemoryTokenStorage {
    pub fn new(refresh_buffer: Duration) -> Self {
        Self {
            token: RwLock::new(None),
            refresh_buffer,
            timer: RefreshTimer::new(),
        }
    }
}

impl Default for MemoryTokenStorage {
    fn default() -> Self {
        Self::new(DEFAULT_REFRESH_BUFFER)
    }
}

#[async_trait]
impl TokenStorage for MemoryTokenStorage {
    async fn store(&self, token: TokenData) {
        let expires_at = token.expires_at;
        *self.token.write().await = Some(token);
        self.timer.arm(expires_at, self.refresh_buffer);
    }

    async fn retrieve(&self) -> Option<TokenData> {
        self.token.read().await.clone()
    }

    async fn is_expired(&self) -> bool {
        match self.token.read().await.as_ref() {
            Some(token) => token.is_expired_with(self.refresh_buffer, SystemTime::now()),
            None => true,
        }
    }

    async fn clear(&self) {
        *self.token.write().await = None;
        self.timer.cancel();
    }

    async fn set_refresh_callback(&self, callback: RefreshCallback) {
        self.timer.set_callback(callback);
        if let Some(token) = self.token.read().await.clone() {
            self.timer.arm(token.expires_at, self.refresh_buffer);
        }
    }
}

/// OS-keychain-backed storage. Keeps a write-through in-process cache so the
/// hot expiry check never round-trips to the secret service, and degrades to
/// the cache alone when the keychain backend fails.
pub struct KeyringTokenStorage {
    service: String,
    server_id: String,
    cache: RwLock<Option<TokenData>>,
    degraded: std::sync::atomic::AtomicBool,
    refresh_buffer: Duration,
    timer: RefreshTimer,
}

pub fn validate_server_id(server_id: &str) -> Result<(), ConfigError> {
    if server_id.is_empty()
        || !server_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(ConfigError::InvalidArgument(format!(
            "{SERVER_ID_CHARSET}, got {server_id:?}"
        )));
    }
    Ok(())
}

impl KeyringTokenStorage {
    pub fn new(
        namespace: impl Into<String>,
        server_id: impl Into<String>,
        refresh_buffer: Duration,
    ) -> Result<Self, ConfigError> {
        let server_id = server_id.into();
        validate_server_id(&server_id)?;
        Ok(Self {
            service: namespace.into(),
            server_id,
            cache: RwLock::new(None),
            degraded: std::sync::atomic::AtomicBool::new(false),
            refresh_buffer,
            timer: RefreshTimer::new(),
        })
    }

    fn mark_degraded(&self, err: &str) {
        if !self.degraded.swap(true, std::sync::atomic::Ordering::SeqCst) {
            warn!(
                target = "auth",
                server = %self.server_id,
                error = %err,
                "keychain unavailable, falling back to in-memory token storage"
            );
        }
    }

    fn is_degraded(&self) -> bool {
        self.degraded.load(std::sync::atomic::Ordering::SeqCst)
    }

    async fn keyring_set(&self, serialized: String) -> Result<(), String> {
        let service = self.service.clone();
        let user = self.server_id.clone();
        tokio::task::spawn_blocking(move || {
            let entry = keyring::Entry::new(&service, &user).map_err(|e| e.to_string())?;
            entry.set_password(&serialized).map_err(|e| e.to_string())
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn keyring_get(&self) -> Result<Option<String>, String> {
        let service = self.service.clone();
        let user = self.server_id.clone();
        tokio::task::spawn_blocking(move || {
            let entry = keyring::Entry::new(&service, &user).map_err(|e| e.to_string())?;
            match entry.get_password() {
                Ok(value) => Ok(Some(value)),
                Err(keyring::Error::NoEntry) => Ok(None),
                Err(err) => Err(err.to_string()),
            }
        })
        .await
        .map_err(|e| e.to_string())?
    }

    async fn keyring_delete(&self) -> Result<(), String> {
        let service = self.service.clone();
        let user = self.server_id.clone();
        tokio::task::spawn_blocking(move || {
            let entry = keyring::Entry::new(&service, &user).map_err(|e| e.to_string())?;
            match entry.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
                Err(err) => Err(err.to_string()),
            }
        })
        .await
        .map_err(|e| e.to_string())?
    }
}

#[async_trait]
impl TokenStorage for KeyringTokenStorage {
    async fn store(&self, token: TokenData) {
        let expires_at = token.expires_at;
        *self.cache.write().await = Some(token.clone());
        if !self.is_degraded() {
            match serde_json::to_string(&token) {
                Ok(serialized) => {
                    if let Err(err) = self.keyring_set(serialized).await {
                        self.mark_degraded(&err);
                    }
                }
                Err(err) => self.mark_degraded(&err.to_string()),
            }
        }
        self.timer.arm(expires_at, self.refresh_buffer);
    }

    async fn retrieve(&self) -> Option<TokenData> {
        if let Some(token) = self.cache.read().await.clone() {
            return Some(token);
        }
        if self.is_degraded() {
            return None;
        }
        match self.keyring_get().await {
            Ok(Some(serialized)) => match serde_json::from_str::<TokenData>(&serialized) {
                Ok(token) => {
                    *self.cache.write().await = Some(token.clone());
                    Some(token)
                }
                Err(err) => {
                    warn!(target = "auth", server = %self.server_id, error = %err,
                          "discarding unparseable stored token");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                self.mark_degraded(&err);
                None
            }
        }
    }

    async fn is_expired(&self) -> bool {
        match self.retrieve().await {
            Some(token) => token.is_expired_with(self.refresh_buffer, SystemTime::now()),
            None => true,
        }
    }

    async fn clear(&self) {
        *self.cache.write().await = None;
        if !self.is_degraded()
            && let Err(err) = self.keyring_delete().await
        {
            self.mark_degraded(&err);
        }
        self.timer.cancel();
    }

    async fn set_refresh_callback(&self, callback: RefreshCallback) {
        self.timer.set_callback(callback);
        if let Some(token) = self.retrieve().await {
            self.timer.arm(token.expires_at, self.refresh_buffer);
        }
    }
}

/// Pick the token storage backend for one server.
///
/// Precedence: explicit `MCP_SWITCHBOARD_TOKEN_STORAGE` override, then the
/// test sentinel, then `CI`, then the OS keychain (which itself degrades to
/// memory when the backend is unusable).
pub fn select_token_storage(
    env: &dyn Environment,
    server_id: &str,
    refresh_buffer: Duration,
) -> Result<Arc<dyn TokenStorage>, ConfigError> {
    match env.var(TOKEN_STORAGE_ENV).as_deref() {
        Some("memory") => return Ok(Arc::new(MemoryTokenStorage::new(refresh_buffer))),
        Some("keyring") => {
            return Ok(Arc::new(KeyringTokenStorage::new(
                crate::config::NAMESPACE,
                server_id,
                refresh_buffer,
            )?));
        }
        Some(other) => {
            warn!(target = "auth", value = %other, "unknown token storage override, using default selection");
        }
        None => {}
    }
    if env.var(RUNTIME_ENV).as_deref() == Some("test") {
        return Ok(Arc::new(MemoryTokenStorage::new(refresh_buffer)));
    }
    if env.var("CI").is_some_and(|v| is_truthy(&v)) {
        return Ok(Arc::new(MemoryTokenStorage::new(refresh_buffer)));
    }
    Ok(Arc::new(KeyringTokenStorage::new(
        crate::config::NAMESPACE,
        server_id,
        refresh_buffer,
    )?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::MapEnvironment;
    use crate::error::AuthError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn token_expiring_in(secs: u64) -> TokenData {
        TokenData::new(
            "tok",
            "Bearer",
            SystemTime::now() + Duration::from_secs(secs),
        )
        .unwrap()
    }

    #[test]
    fn token_data_rejects_empty_fields() {
        assert!(TokenData::new("", "Bearer", SystemTime::now()).is_err());
        assert!(TokenData::new("tok", "", SystemTime::now()).is_err());
    }

    #[test]
    fn expiry_boundaries() {
        let buffer = Duration::from_secs(300);
        let now = SystemTime::now();
        // expires_at == now is expired
        let token = TokenData::new("t", "Bearer", now).unwrap();
        assert!(token.is_expired_with(buffer, now));
        // expires_at == now + buffer is expired (proactive window)
        let token = TokenData::new("t", "Bearer", now + buffer).unwrap();
        assert!(token.is_expired_with(buffer, now));
        // just beyond the buffer is live
        let token = TokenData::new("t", "Bearer", now + buffer + Duration::from_secs(1)).unwrap();
        assert!(!token.is_expired_with(buffer, now));
    }

    #[tokio::test]
    async fn store_retrieve_clear_round_trip() {
        let storage = MemoryTokenStorage::default();
        assert!(storage.retrieve().await.is_none());
        assert!(storage.is_expired().await);

        let token = token_expiring_in(3600);
        storage.store(token.clone()).await;
        assert_eq!(storage.retrieve().await, Some(token));
        assert!(!storage.is_expired().await);

        storage.clear().await;
        assert!(storage.retrieve().await.is_none());
        assert!(storage.is_expired().await);
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_timer_fires_before_expiry() {
        let storage = MemoryTokenStorage::new(Duration::from_secs(300));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        storage
            .set_refresh_callback(Arc::new(move || {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }))
            .await;
        storage.store(token_expiring_in(600)).await;
        // fires at expires_at - buffer = 300s from now
        tokio::time::sleep(Duration::from_secs(301)).await;
        tokio::task::yield_now().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn store_rearms_and_clear_cancels() {
        let storage = MemoryTokenStorage::new(Duration::from_secs(300));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        storage
            .set_refresh_callback(Arc::new(move || {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }))
            .await;
        storage.store(token_expiring_in(600)).await;
        // replacing the token cancels the pending timer and arms a later one
        storage.store(token_expiring_in(1200)).await;
        tokio::time::sleep(Duration::from_secs(400)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        storage.clear().await;
        tokio::time::sleep(Duration::from_secs(2000)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn no_timer_for_already_expired_token() {
        let storage = MemoryTokenStorage::new(Duration::from_secs(300));
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        storage
            .set_refresh_callback(Arc::new(move || {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }))
            .await;
        storage.store(token_expiring_in(10)).await;
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_callback_is_swallowed() {
        let storage = MemoryTokenStorage::new(Duration::from_secs(300));
        storage
            .set_refresh_callback(Arc::new(|| {
                Box::pin(async { Err(AuthError::NetworkError("refused".into())) })
            }))
            .await;
        storage.store(token_expiring_in(600)).await;
        tokio::time::sleep(Duration::from_secs(301)).await;
        tokio::task::yield_now().await;
        // a later store still re-arms cleanly
        storage.store(token_expiring_in(600)).await;
    }

    #[test]
    fn keyring_rejects_hostile_server_ids() {
        for bad in ["; rm -rf /", "a b", "a\0b", "a/b", "", "a$(id)"] {
            let err = KeyringTokenStorage::new("ns", bad, DEFAULT_REFRESH_BUFFER)
                .err()
                .expect("should reject");
            assert!(matches!(err, ConfigError::InvalidArgument(_)), "{bad:?}");
        }
        assert!(KeyringTokenStorage::new("ns", "srv-1.prod_x", DEFAULT_REFRESH_BUFFER).is_ok());
    }

    #[test]
    fn selection_precedence() {
        // explicit override wins over CI
        let env = MapEnvironment::new([(TOKEN_STORAGE_ENV, "memory"), ("CI", "1")]);
        assert!(select_token_storage(&env, "srv", DEFAULT_REFRESH_BUFFER).is_ok());

        // test sentinel forces memory even for a hostile id (no keychain touched)
        let env = MapEnvironment::new([(RUNTIME_ENV, "test")]);
        assert!(select_token_storage(&env, "; rm -rf /", DEFAULT_REFRESH_BUFFER).is_ok());

        // CI forces memory
        let env = MapEnvironment::new([("CI", "true")]);
        assert!(select_token_storage(&env, "srv", DEFAULT_REFRESH_BUFFER).is_ok());

        // auto path validates the id before any keychain access
        let env = MapEnvironment::default();
        assert!(select_token_storage(&env, "; rm -rf /", DEFAULT_REFRESH_BUFFER).is_err());
    }
}
