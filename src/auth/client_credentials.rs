use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;

use crate::error::AuthError;
use crate::token_store::{TokenData, TokenStorage};

use super::{
    AUTHORIZATION_HEADER, AuthProvider, RefreshGate, authorization_header_value,
    post_token_request,
};

/// OAuth2 client-credentials grant. Tokens are machine-to-machine and renew
/// without user interaction, so `headers` can acquire on demand.
pub struct ClientCredentialsProvider {
    http: reqwest::Client,
    client_id: String,
    client_secret: String,
    token_endpoint: String,
    scope: Option<String>,
    audience: Option<String>,
    storage: Arc<dyn TokenStorage>,
    gate: RefreshGate,
}

impl ClientCredentialsProvider {
    pub fn new(
        client_id: String,
        client_secret: String,
        token_endpoint: String,
        scope: Option<String>,
        audience: Option<String>,
        storage: Arc<dyn TokenStorage>,
    ) -> Arc<Self> {
        let provider = Arc::new(Self {
            http: reqwest::Client::new(),
            client_id,
            client_secret,
            token_endpoint,
            scope,
            audience,
            storage,
            gate: RefreshGate::new(),
        });
        install_proactive_refresh(&provider);
        provider
    }

    fn acquire_future(&self) -> BoxFuture<'static, Result<(), AuthError>> {
        let http = self.http.clone();
        let client_id = self.client_id.clone();
        let client_secret = self.client_secret.clone();
        let token_endpoint = self.token_endpoint.clone();
        let scope = self.scope.clone();
        let audience = self.audience.clone();
        let storage = self.storage.clone();
        async move {
            let mut params = vec![
                ("grant_type", "client_credentials"),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
            ];
            if let Some(scope) = scope.as_deref() {
                params.push(("scope", scope));
            }
            if let Some(audience) = audience.as_deref() {
                params.push(("audience", audience));
            }
            let response = post_token_request(&http, &token_endpoint, &params).await?;
            let expires_at = SystemTime::now() + Duration::from_secs(response.expires_in);
            let token = TokenData::new(response.access_token, response.token_type, expires_at)
                .map_err(|err| AuthError::TokenAcquisitionFailed(err.to_string()))?
                .with_scope(response.scope)
                .with_refresh_token(response.refresh_token);
            storage.store(token).await;
            tracing::debug!(target = "auth", "client credentials token acquired");
            Ok(())
        }
        .boxed()
    }
}

/// Arm the storage's proactive-refresh timer to call back into the provider
/// without creating a strong reference cycle.
fn install_proactive_refresh(provider: &Arc<ClientCredentialsProvider>) {
    let weak: Weak<ClientCredentialsProvider> = Arc::downgrade(provider);
    let storage = provider.storage.clone();
    tokio::spawn(async move {
        storage
            .set_refresh_callback(Arc::new(move || {
                let weak = weak.clone();
                async move {
                    match weak.upgrade() {
                        Some(provider) => provider.refresh().await,
                        None => Ok(()),
                    }
                }
                .boxed()
            }))
            .await;
    });
}

#[async_trait]
impl AuthProvider for ClientCredentialsProvider {
    async fn headers(&self) -> Result<HashMap<String, String>, AuthError> {
        if self.storage.is_expired().await {
            self.refresh().await?;
        }
        let token = self.storage.retrieve().await.ok_or_else(|| {
            AuthError::TokenAcquisitionFailed("storage empty after refresh".into())
        })?;
        Ok(HashMap::from([(
            AUTHORIZATION_HEADER.to_string(),
            authorization_header_value(&token.token_type, &token.access_token),
        )]))
    }

    async fn is_valid(&self) -> bool {
        !self.storage.is_expired().await
    }

    async fn refresh(&self) -> Result<(), AuthError> {
        self.gate.run(|| self.acquire_future()).await
    }
}
