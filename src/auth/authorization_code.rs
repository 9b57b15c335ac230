use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use futures::FutureExt;
use futures::future::BoxFuture;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::sync::oneshot;

use crate::error::AuthError;
use crate::events::{EventEmitter, authorization_pending};
use crate::token_store::{TokenData, TokenStorage};

use super::flow_registry::{FlowHandler, OAuthFlowRegistry};
use super::{
    AUTHORIZATION_HEADER, AuthProvider, FLOW_TTL, RefreshGate, authorization_header_value,
    post_token_request,
};

/// 32 random bytes, base64url without padding: 43 characters, inside the
/// RFC 7636 43..128 window.
pub fn generate_code_verifier() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// CSRF state: 16 random bytes, base64url.
pub fn generate_state() -> String {
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// OAuth2 authorization-code grant with PKCE. `refresh` opens a flow in the
/// process-wide registry, surfaces the authorization URL as an event, and
/// stays pending until the host relays the callback via `complete`, the flow
/// is cancelled, or the 10-minute window lapses.
pub struct AuthorizationCodeProvider {
    server_name: String,
    http: reqwest::Client,
    client_id: String,
    client_secret: Option<String>,
    authorization_endpoint: String,
    token_endpoint: String,
    redirect_uri: String,
    scope: Option<String>,
    audience: Option<String>,
    storage: Arc<dyn TokenStorage>,
    flows: Arc<OAuthFlowRegistry>,
    emitter: Arc<dyn EventEmitter>,
    gate: RefreshGate,
    active_state: Mutex<Option<String>>,
}

impl AuthorizationCodeProvider {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        server_name: String,
        client_id: String,
        client_secret: Option<String>,
        authorization_endpoint: String,
        token_endpoint: String,
        redirect_uri: String,
        scope: Option<String>,
        audience: Option<String>,
        storage: Arc<dyn TokenStorage>,
        flows: Arc<OAuthFlowRegistry>,
        emitter: Arc<dyn EventEmitter>,
    ) -> Arc<Self> {
        Arc::new(Self {
            server_name,
            http: reqwest::Client::new(),
            client_id,
            client_secret,
            authorization_endpoint,
            token_endpoint,
            redirect_uri,
            scope,
            audience,
            storage,
            flows,
            emitter,
            gate: RefreshGate::new(),
            active_state: Mutex::new(None),
        })
    }

    /// The URL the user must visit. Carries the PKCE challenge and CSRF
    /// state; never any token material.
    pub fn authorization_url(&self, state: &str, challenge: &str) -> Result<String, AuthError> {
        let mut url = reqwest::Url::parse(&self.authorization_endpoint)
            .map_err(|err| AuthError::ParseError(format!("authorization endpoint: {err}")))?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("response_type", "code");
            query.append_pair("client_id", &self.client_id);
            query.append_pair("redirect_uri", &self.redirect_uri);
            query.append_pair("state", state);
            query.append_pair("code_challenge", challenge);
            query.append_pair("code_challenge_method", "S256");
            if let Some(scope) = self.scope.as_deref() {
                query.append_pair("scope", scope);
            }
            if let Some(audience) = self.audience.as_deref() {
                query.append_pair("audience", audience);
            }
        }
        Ok(url.into())
    }

    fn acquire_future(&self) -> BoxFuture<'static, Result<(), AuthError>> {
        let verifier = generate_code_verifier();
        let state = generate_state();
        let url = match self.authorization_url(&state, &code_challenge(&verifier)) {
            Ok(url) => url,
            Err(err) => return async move { Err(err) }.boxed(),
        };

        let (done_tx, done_rx) = oneshot::channel();
        let flow = Arc::new(ExchangeFlow {
            http: self.http.clone(),
            token_endpoint: self.token_endpoint.clone(),
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            redirect_uri: self.redirect_uri.clone(),
            code_verifier: verifier,
            storage: self.storage.clone(),
            done: Mutex::new(Some(done_tx)),
        });

        *self.active_state.lock().unwrap() = Some(state.clone());

        let flows = self.flows.clone();
        let emitter = self.emitter.clone();
        let server_name = self.server_name.clone();
        async move {
            flows.register(state, flow, FLOW_TTL).await;
            tracing::info!(target = "oauth", server = %server_name, "authorization required, waiting for callback");
            authorization_pending(emitter.as_ref(), &server_name, &url);
            match tokio::time::timeout(FLOW_TTL, done_rx).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => Err(AuthError::AuthorizationTimeout),
                Err(_) => Err(AuthError::AuthorizationTimeout),
            }
        }
        .boxed()
    }
}

impl Drop for AuthorizationCodeProvider {
    fn drop(&mut self) {
        let state = self.active_state.lock().unwrap().take();
        if let (Some(state), Ok(handle)) = (state, tokio::runtime::Handle::try_current()) {
            let flows = self.flows.clone();
            handle.spawn(async move { flows.cancel(&state).await });
        }
    }
}

#[async_trait]
impl AuthProvider for AuthorizationCodeProvider {
    async fn headers(&self) -> Result<HashMap<String, String>, AuthError> {
        if self.storage.is_expired().await {
            self.refresh().await?;
        }
        let token = self.storage.retrieve().await.ok_or_else(|| {
            AuthError::TokenAcquisitionFailed("storage empty after authorization".into())
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

/// Exchange half of one pending flow. Registered in the flow registry under
/// its CSRF state; consumed exactly once.
struct ExchangeFlow {
    http: reqwest::Client,
    token_endpoint: String,
    client_id: String,
    client_secret: Option<String>,
    redirect_uri: String,
    code_verifier: String,
    storage: Arc<dyn TokenStorage>,
    done: Mutex<Option<oneshot::Sender<Result<(), AuthError>>>>,
}

impl ExchangeFlow {
    fn resolve(&self, outcome: Result<(), AuthError>) {
        if let Some(sender) = self.done.lock().unwrap().take() {
            let _ = sender.send(outcome);
        }
    }
}

#[async_trait]
impl FlowHandler for ExchangeFlow {
    async fn complete(&self, code: &str) -> Result<(), AuthError> {
        let mut params = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.redirect_uri.as_str()),
            ("client_id", self.client_id.as_str()),
            ("code_verifier", self.code_verifier.as_str()),
        ];
        if let Some(secret) = self.client_secret.as_deref() {
            params.push(("client_secret", secret));
        }
        let outcome = async {
            let response = post_token_request(&self.http, &self.token_endpoint, &params).await?;
            let expires_at = SystemTime::now() + Duration::from_secs(response.expires_in);
            let token = TokenData::new(response.access_token, response.token_type, expires_at)
                .map_err(|err| AuthError::TokenAcquisitionFailed(err.to_string()))?
                .with_scope(response.scope)
                .with_refresh_token(response.refresh_token);
            self.storage.store(token).await;
            Ok(())
        }
        .await;
        self.resolve(outcome.clone());
        outcome
    }

    async fn cancel(&self) {
        self.resolve(Err(AuthError::AuthorizationTimeout));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::BufferingEventEmitter;
    use crate::token_store::MemoryTokenStorage;

    fn provider(emitter: Arc<dyn EventEmitter>) -> Arc<AuthorizationCodeProvider> {
        AuthorizationCodeProvider::new(
            "srv".into(),
            "client".into(),
            None,
            "https://idp.example/authorize".into(),
            "https://idp.example/token".into(),
            "http://127.0.0.1:7777/callback".into(),
            Some("mcp".into()),
            None,
            Arc::new(MemoryTokenStorage::default()),
            OAuthFlowRegistry::new(),
            emitter,
        )
    }

    #[test]
    fn verifier_and_challenge_shapes() {
        let verifier = generate_code_verifier();
        assert_eq!(verifier.len(), 43);
        let challenge = code_challenge(&verifier);
        assert_eq!(challenge.len(), 43);
        assert_eq!(challenge, code_challenge(&verifier));
        assert_ne!(challenge, verifier);
        assert!(generate_state().len() >= 22);
        assert_ne!(generate_state(), generate_state());
    }

    #[test]
    fn challenge_matches_rfc7636_test_vector() {
        // Appendix B of RFC 7636
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            code_challenge(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[tokio::test]
    async fn authorization_url_has_pkce_and_no_tokens() {
        let provider = provider(Arc::new(BufferingEventEmitter::default()));
        let state = generate_state();
        let verifier = generate_code_verifier();
        let url = provider
            .authorization_url(&state, &code_challenge(&verifier))
            .unwrap();
        let parsed = reqwest::Url::parse(&url).unwrap();
        let params: std::collections::HashMap<_, _> = parsed.query_pairs().collect();
        assert_eq!(params.get("response_type").map(|v| v.as_ref()), Some("code"));
        assert_eq!(
            params.get("code_challenge_method").map(|v| v.as_ref()),
            Some("S256")
        );
        assert_eq!(params.get("state").map(|v| v.as_ref()), Some(state.as_str()));
        assert_eq!(params.get("code_challenge").map(|v| v.len()), Some(43));
        assert_eq!(params.get("scope").map(|v| v.as_ref()), Some("mcp"));
        for forbidden in ["access_token", "id_token", "refresh_token"] {
            assert!(!params.contains_key(forbidden), "{forbidden} leaked");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_times_out_without_callback() {
        let emitter = BufferingEventEmitter::default();
        let provider = provider(Arc::new(emitter.clone()));
        let refresh = tokio::spawn({
            let provider = provider.clone();
            async move { provider.refresh().await }
        });
        tokio::time::sleep(FLOW_TTL + Duration::from_secs(1)).await;
        let err = refresh.await.unwrap().unwrap_err();
        assert_eq!(err, AuthError::AuthorizationTimeout);
        assert_eq!(emitter.count(crate::events::EVENT_AUTHORIZATION_PENDING), 1);
    }
}
